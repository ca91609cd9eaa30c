//!
//! In-memory collaborators for tests. `MemoryBackend` implements every store,
//! the change feed and auth; tests drive "remote" changes through it, choose
//! whether they are pushed or only visible to polling, and inject failures.
//!

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;

use crate::geo_source::haversine_m;
use crate::services::*;
use crate::ODM::models::*;

#[derive(Default)]
struct State {
    rides: Vec<RideRecord>,
    drivers: HashMap<String, DriverRecord>,
    profiles: HashMap<String, UserProfile>,
    messages: Vec<ChatMessage>,
    emergencies: Vec<Emergency>,
    declined: Vec<(String, i64)>,
    sessions: HashMap<String, Session>,
    calls: Vec<String>,
    failing: HashMap<String, ServiceError>,
    ride_watchers: Vec<(RideScope, mpsc::Sender<RideRecord>)>,
    pending_watchers: Vec<mpsc::Sender<RideRecord>>,
    driver_watchers: Vec<(String, mpsc::Sender<DriverRecord>)>,
    clock: Option<DateTime<Utc>>,
}

impl State {
    /// Strictly increasing timestamps, even within one clock tick
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn check(&mut self, op: &str) -> ServiceResult<()> {
        self.calls.push(op.to_string());
        match self.failing.get(op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn notify_ride(&mut self, ride: &RideRecord) {
        self.ride_watchers.retain(|(scope, tx)| {
            if in_scope(scope, ride) {
                tx.try_send(ride.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    fn notify_insert(&mut self, ride: &RideRecord) {
        self.pending_watchers.retain(|tx| tx.try_send(ride.clone()).is_ok());
    }

    fn ride_mut(&mut self, ride_id: i64) -> Option<&mut RideRecord> {
        self.rides.iter_mut().find(|r| r.ride_id == ride_id)
    }
}

fn in_scope(scope: &RideScope, ride: &RideRecord) -> bool {
    match scope {
        RideScope::Passenger(id) => ride.passenger_id == *id,
        RideScope::Driver(id) => ride.driver_id.as_deref() == Some(id.as_str()),
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let backend = Arc::new(self.clone());
        Collaborators {
            auth: backend.clone(),
            rides: backend.clone(),
            drivers: backend.clone(),
            users: backend.clone(),
            messages: backend.clone(),
            emergencies: backend.clone(),
            feed: backend,
            geocoder: Arc::new(FakeGeocoder::default()),
            router: Arc::new(FakeRouter::default()),
            objects: Arc::new(FakeObjects),
        }
    }

    /// Every failing call of `op` returns `error` until `recover`
    pub fn fail(&self, op: &str, error: ServiceError) {
        self.state().failing.insert(op.to_string(), error);
    }

    pub fn recover(&self, op: &str) {
        self.state().failing.remove(op);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == op).count()
    }

    pub fn add_session(&self, token: &str, user_id: &str, role: Role) {
        let session = Session {
            token: token.to_string(),
            user_id: user_id.to_string(),
            role,
            email: format!("{}@example.com", user_id),
            display_name: user_id.to_string(),
            avatar_url: None,
            phone: None,
            preferred_color: None,
        };
        self.state().sessions.insert(token.to_string(), session);
    }

    /// The auth service forgets the token, as when it expires
    pub fn expire_session(&self, token: &str) {
        self.state().sessions.remove(token);
    }

    pub fn add_driver(&self, driver_id: &str, verification: VerificationStatus) {
        let record = DriverRecord {
            driver_id: driver_id.to_string(),
            status: DriverStatus::Offline,
            verification_status: verification,
            last_status_change: None,
            current: None,
            location_accuracy: None,
            last_location_update: None,
            pedicab_plate: Some("PC-0042".to_string()),
            registration_group: None,
        };
        self.state().drivers.insert(driver_id.to_string(), record);
    }

    pub fn driver_record(&self, driver_id: &str) -> Option<DriverRecord> {
        self.state().drivers.get(driver_id).cloned()
    }

    pub fn rides(&self) -> Vec<RideRecord> {
        self.state().rides.clone()
    }

    pub fn ride_by_id(&self, ride_id: i64) -> Option<RideRecord> {
        self.state().rides.iter().find(|r| r.ride_id == ride_id).cloned()
    }

    pub fn emergencies(&self) -> Vec<Emergency> {
        self.state().emergencies.clone()
    }

    /// A ride as another party would create it, pushed to insert watchers
    pub fn seed_ride(&self, passenger_id: &str, status: RideStatus, driver_id: Option<&str>) -> RideRecord {
        let mut state = self.state();
        let at = state.tick();
        let ride = RideRecord {
            ride_id: state.rides.iter().map(|r| r.ride_id).max().unwrap_or(0) + 1,
            passenger_id: passenger_id.to_string(),
            driver_id: driver_id.map(|d| d.to_string()),
            pickup_location: "Silliman University".to_string(),
            dropoff_location: "Robinsons Place".to_string(),
            pickup: Some(Coordinates::new(9.3122, 123.3065)),
            dropoff: Some(Coordinates::new(9.2995, 123.2950)),
            status,
            price: 0.0,
            rating: None,
            review_text: None,
            requested_at: at,
            updated_at: at,
        };
        state.rides.push(ride.clone());
        if status == RideStatus::Pending {
            state.notify_insert(&ride);
        }
        state.notify_ride(&ride);
        ride
    }

    /// A remote update; `push` chooses whether the feed delivers it or only polling sees it
    pub fn remote_update<F>(&self, ride_id: i64, push: bool, change: F) -> Option<RideRecord>
    where
        F: FnOnce(&mut RideRecord),
    {
        let mut state = self.state();
        let at = state.tick();
        let ride = state.ride_mut(ride_id)?;
        change(ride);
        ride.updated_at = at;
        let ride = ride.clone();
        if push {
            state.notify_ride(&ride);
        }
        Some(ride)
    }

    /// Delivers a record through the feed without storing it, as a late duplicate would
    pub fn push_stale(&self, ride: RideRecord) {
        self.state().notify_ride(&ride);
    }

    pub fn move_driver(&self, driver_id: &str, coords: Coordinates) {
        let mut state = self.state();
        let at = state.tick();
        let record = match state.drivers.get_mut(driver_id) {
            Some(record) => {
                record.current = Some(coords);
                record.last_location_update = Some(at);
                record.clone()
            }
            None => return,
        };
        let driver_id = driver_id.to_string();
        state
            .driver_watchers
            .retain(|(id, tx)| *id != driver_id || tx.try_send(record.clone()).is_ok());
    }
}

fn updated<F>(state: &mut State, ride_id: i64, allowed: F, change: impl FnOnce(&mut RideRecord)) -> Option<RideRecord>
where
    F: FnOnce(&RideRecord) -> bool,
{
    let at = state.tick();
    let ride = state.ride_mut(ride_id)?;
    if !allowed(&*ride) {
        return None;
    }
    change(ride);
    ride.updated_at = at;
    let ride = ride.clone();
    state.notify_ride(&ride);
    Some(ride)
}

#[rocket::async_trait]
impl AuthProvider for MemoryBackend {
    async fn current_session(&self, token: &str) -> ServiceResult<Option<Session>> {
        let mut state = self.state();
        state.check("current_session")?;
        Ok(state.sessions.get(token).cloned())
    }

    async fn sign_out(&self, token: &str) -> ServiceResult<()> {
        let mut state = self.state();
        state.check("sign_out")?;
        state.sessions.remove(token);
        Ok(())
    }
}

#[rocket::async_trait]
impl RideStore for MemoryBackend {
    async fn insert_ride(&self, ride: NewRide) -> ServiceResult<RideRecord> {
        let mut state = self.state();
        state.check("insert_ride")?;
        let at = state.tick();
        let record = RideRecord {
            ride_id: state.rides.iter().map(|r| r.ride_id).max().unwrap_or(0) + 1,
            passenger_id: ride.passenger_id,
            driver_id: None,
            pickup_location: ride.pickup_location,
            dropoff_location: ride.dropoff_location,
            pickup: ride.pickup,
            dropoff: ride.dropoff,
            status: RideStatus::Pending,
            price: 0.0,
            rating: None,
            review_text: None,
            requested_at: at,
            updated_at: at,
        };
        state.rides.push(record.clone());
        state.notify_insert(&record);
        state.notify_ride(&record);
        Ok(record)
    }

    async fn ride(&self, ride_id: i64) -> ServiceResult<Option<RideRecord>> {
        let mut state = self.state();
        state.check("ride")?;
        Ok(state.rides.iter().find(|r| r.ride_id == ride_id).cloned())
    }

    async fn latest_ride(&self, scope: &RideScope) -> ServiceResult<Option<RideRecord>> {
        let mut state = self.state();
        state.check("latest_ride")?;
        let newest = |active: bool| {
            state
                .rides
                .iter()
                .filter(|r| in_scope(scope, r) && (!active || r.status.is_active()))
                .max_by_key(|r| (r.requested_at, r.ride_id))
                .cloned()
        };
        Ok(newest(true).or_else(|| newest(false)))
    }

    async fn active_ride(&self, scope: &RideScope) -> ServiceResult<Option<RideRecord>> {
        let mut state = self.state();
        state.check("active_ride")?;
        Ok(state
            .rides
            .iter()
            .filter(|r| in_scope(scope, r) && r.status.is_active())
            .max_by_key(|r| (r.requested_at, r.ride_id))
            .cloned())
    }

    async fn cancel_ride(&self, ride_id: i64) -> ServiceResult<Option<RideRecord>> {
        let mut state = self.state();
        state.check("cancel_ride")?;
        Ok(updated(
            &mut state,
            ride_id,
            |r| r.status == RideStatus::Pending && r.driver_id.is_none(),
            |r| r.status = RideStatus::Cancelled,
        ))
    }

    async fn cancel_pending_for_passenger(&self, passenger_id: &str) -> ServiceResult<u64> {
        let mut state = self.state();
        state.check("cancel_pending_for_passenger")?;
        let ids: Vec<i64> = state
            .rides
            .iter()
            .filter(|r| r.passenger_id == passenger_id && r.status == RideStatus::Pending)
            .map(|r| r.ride_id)
            .collect();
        for id in &ids {
            updated(&mut state, *id, |_| true, |r| r.status = RideStatus::Cancelled);
        }
        Ok(ids.len() as u64)
    }

    async fn accept_ride(&self, ride_id: i64, driver_id: &str) -> ServiceResult<Option<RideRecord>> {
        let mut state = self.state();
        state.check("accept_ride")?;
        Ok(updated(
            &mut state,
            ride_id,
            |r| r.status == RideStatus::Pending,
            |r| {
                r.status = RideStatus::Accepted;
                r.driver_id = Some(driver_id.to_string());
            },
        ))
    }

    async fn start_trip(&self, ride_id: i64, driver_id: &str) -> ServiceResult<Option<RideRecord>> {
        let mut state = self.state();
        state.check("start_trip")?;
        Ok(updated(
            &mut state,
            ride_id,
            |r| r.status == RideStatus::Accepted && r.driver_id.as_deref() == Some(driver_id),
            |r| r.status = RideStatus::OnTrip,
        ))
    }

    async fn complete_ride(&self, ride_id: i64, driver_id: &str, price: f64) -> ServiceResult<Option<RideRecord>> {
        let mut state = self.state();
        state.check("complete_ride")?;
        Ok(updated(
            &mut state,
            ride_id,
            |r| {
                matches!(r.status, RideStatus::Accepted | RideStatus::OnTrip)
                    && r.driver_id.as_deref() == Some(driver_id)
            },
            |r| {
                r.status = RideStatus::Completed;
                r.price = price;
            },
        ))
    }

    async fn rate_ride(&self, ride_id: i64, rating: u8, feedback: &str) -> ServiceResult<Option<RideRecord>> {
        let mut state = self.state();
        state.check("rate_ride")?;
        Ok(updated(
            &mut state,
            ride_id,
            |r| r.status == RideStatus::Completed,
            |r| {
                r.rating = Some(rating);
                r.review_text = Some(feedback.to_string());
            },
        ))
    }

    async fn pending_rides(&self) -> ServiceResult<Vec<RideRecord>> {
        let mut state = self.state();
        state.check("pending_rides")?;
        let mut pending: Vec<RideRecord> = state
            .rides
            .iter()
            .filter(|r| r.status == RideStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.ride_id.cmp(&a.ride_id));
        Ok(pending)
    }

    async fn newest_pending_id(&self) -> ServiceResult<Option<i64>> {
        let mut state = self.state();
        state.check("newest_pending_id")?;
        Ok(state
            .rides
            .iter()
            .filter(|r| r.status == RideStatus::Pending)
            .map(|r| r.ride_id)
            .max())
    }

    async fn declined_ride_ids(&self, driver_id: &str) -> ServiceResult<Vec<i64>> {
        let mut state = self.state();
        state.check("declined_ride_ids")?;
        Ok(state
            .declined
            .iter()
            .filter(|(d, _)| d == driver_id)
            .map(|(_, id)| *id)
            .collect())
    }

    async fn decline_ride(&self, driver_id: &str, ride_id: i64) -> ServiceResult<()> {
        let mut state = self.state();
        state.check("decline_ride")?;
        state.declined.push((driver_id.to_string(), ride_id));
        Ok(())
    }

    async fn trip_history(&self, passenger_id: &str, limit: i64) -> ServiceResult<Vec<RideRecord>> {
        let mut state = self.state();
        state.check("trip_history")?;
        let mut history: Vec<RideRecord> = state
            .rides
            .iter()
            .filter(|r| r.passenger_id == passenger_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        history.truncate(limit.max(0) as usize);
        Ok(history)
    }

    async fn completed_by_driver_since(&self, driver_id: &str, since: DateTime<Utc>) -> ServiceResult<Vec<RideRecord>> {
        let mut state = self.state();
        state.check("completed_by_driver_since")?;
        Ok(state
            .rides
            .iter()
            .filter(|r| {
                r.status == RideStatus::Completed
                    && r.driver_id.as_deref() == Some(driver_id)
                    && r.updated_at >= since
            })
            .cloned()
            .collect())
    }
}

#[rocket::async_trait]
impl DriverStore for MemoryBackend {
    async fn driver(&self, driver_id: &str) -> ServiceResult<Option<DriverRecord>> {
        let mut state = self.state();
        state.check("driver")?;
        Ok(state.drivers.get(driver_id).cloned())
    }

    async fn set_status(&self, driver_id: &str, status: DriverStatus, at: DateTime<Utc>) -> ServiceResult<()> {
        let mut state = self.state();
        state.check("set_status")?;
        match state.drivers.get_mut(driver_id) {
            Some(record) => {
                record.status = status;
                record.last_status_change = Some(at);
                Ok(())
            }
            None => Err(ServiceError::NotFound(format!("driver {}", driver_id))),
        }
    }

    async fn publish_location(&self, driver_id: &str, coords: Coordinates, accuracy: f64, at: DateTime<Utc>) -> ServiceResult<()> {
        let mut state = self.state();
        state.check("publish_location")?;
        if let Some(record) = state.drivers.get_mut(driver_id) {
            record.current = Some(coords);
            record.location_accuracy = Some(accuracy);
            record.last_location_update = Some(at);
        }
        Ok(())
    }

    async fn available_drivers(&self) -> ServiceResult<Vec<DriverRecord>> {
        let mut state = self.state();
        state.check("available_drivers")?;
        Ok(state
            .drivers
            .values()
            .filter(|d| d.status == DriverStatus::Online && d.verification_status == VerificationStatus::Verified)
            .cloned()
            .collect())
    }
}

#[rocket::async_trait]
impl UserStore for MemoryBackend {
    async fn profile(&self, user_id: &str) -> ServiceResult<Option<UserProfile>> {
        let mut state = self.state();
        state.check("profile")?;
        Ok(state.profiles.get(user_id).cloned())
    }

    async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> ServiceResult<()> {
        let mut state = self.state();
        state.check("update_profile")?;
        let previous = state.profiles.get(user_id).cloned();
        let profile = UserProfile {
            user_id: user_id.to_string(),
            fullname: update.fullname,
            phone: update.phone,
            avatar_url: update.avatar_url.or_else(|| previous.and_then(|p| p.avatar_url)),
            preferred_color: update.preferred_color,
        };
        state.profiles.insert(user_id.to_string(), profile);
        Ok(())
    }
}

#[rocket::async_trait]
impl MessageStore for MemoryBackend {
    async fn send_message(&self, ride_id: i64, sender_id: &str, content: &str) -> ServiceResult<ChatMessage> {
        let mut state = self.state();
        state.check("send_message")?;
        let message = ChatMessage {
            ride_id,
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: state.tick(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn messages(&self, ride_id: i64) -> ServiceResult<Vec<ChatMessage>> {
        let mut state = self.state();
        state.check("messages")?;
        Ok(state.messages.iter().filter(|m| m.ride_id == ride_id).cloned().collect())
    }
}

#[rocket::async_trait]
impl EmergencyStore for MemoryBackend {
    async fn create_emergency(&self, emergency: NewEmergency) -> ServiceResult<Emergency> {
        let mut state = self.state();
        state.check("create_emergency")?;
        let record = Emergency {
            emergency_id: state.emergencies.len() as i64 + 1,
            user_id: emergency.user_id,
            kind: if emergency.ride_id.is_some() {
                "Passenger SOS".to_string()
            } else {
                "General SOS".to_string()
            },
            ride_id: emergency.ride_id,
            status: "active".to_string(),
            location: emergency.location,
            created_at: state.tick(),
        };
        state.emergencies.push(record.clone());
        Ok(record)
    }
}

#[rocket::async_trait]
impl ChangeFeed for MemoryBackend {
    async fn ride_notifications(&self, scope: &RideScope) -> ServiceResult<Notifications<RideRecord>> {
        let mut state = self.state();
        state.check("ride_notifications")?;
        let (tx, rx) = mpsc::channel(32);
        state.ride_watchers.push((scope.clone(), tx));
        Ok(rx)
    }

    async fn pending_ride_inserts(&self) -> ServiceResult<Notifications<RideRecord>> {
        let mut state = self.state();
        state.check("pending_ride_inserts")?;
        let (tx, rx) = mpsc::channel(32);
        state.pending_watchers.push(tx);
        Ok(rx)
    }

    async fn driver_updates(&self, driver_id: &str) -> ServiceResult<Notifications<DriverRecord>> {
        let mut state = self.state();
        state.check("driver_updates")?;
        let (tx, rx) = mpsc::channel(32);
        state.driver_watchers.push((driver_id.to_string(), tx));
        Ok(rx)
    }
}

/// Geocodes from a fixed table; everything else is "not found"
#[derive(Default)]
pub struct FakeGeocoder {
    pub known: HashMap<String, Coordinates>,
    pub failing: HashSet<String>,
    pub lookups: Mutex<Vec<String>>,
}

impl FakeGeocoder {
    pub fn with(known: &[(&str, Coordinates)], failing: &[&str]) -> Self {
        Self {
            known: known.iter().map(|(name, c)| (name.to_string(), *c)).collect(),
            failing: failing.iter().map(|name| name.to_string()).collect(),
            lookups: Mutex::new(vec![]),
        }
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[rocket::async_trait]
impl Geocoder for FakeGeocoder {
    async fn geocode(&self, address: &str) -> ServiceResult<Option<GeocodeHit>> {
        if let Ok(mut lookups) = self.lookups.lock() {
            lookups.push(address.to_string());
        }
        if self.failing.contains(address) {
            return Err(ServiceError::Unavailable("geocoder down".to_string()));
        }
        Ok(self.known.get(address).map(|coords| GeocodeHit {
            coords: *coords,
            display_name: address.to_string(),
        }))
    }

    /// The known place within 50 m, "reverse" in `failing` makes it fail
    async fn reverse_geocode(&self, at: Coordinates) -> ServiceResult<Option<String>> {
        if self.failing.contains("reverse") {
            return Err(ServiceError::Unavailable("geocoder down".to_string()));
        }
        Ok(self
            .known
            .iter()
            .find(|(_, coords)| haversine_m(at, **coords) <= 50.0)
            .map(|(name, _)| name.clone()))
    }

    async fn suggest(&self, query: &str, _near: Option<Coordinates>) -> ServiceResult<Vec<Suggestion>> {
        Ok(self
            .known
            .iter()
            .filter(|(name, _)| name.to_lowercase().contains(&query.to_lowercase()))
            .map(|(name, coords)| Suggestion {
                display_name: name.clone(),
                coords: *coords,
                distance: 0.0,
            })
            .collect())
    }
}

/// 1 km and 6 minutes per leg, or a failure when `down`
#[derive(Default)]
pub struct FakeRouter {
    pub down: bool,
    pub requests: Mutex<Vec<Vec<Coordinates>>>,
}

impl FakeRouter {
    pub fn requests(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[rocket::async_trait]
impl Router for FakeRouter {
    async fn route(&self, waypoints: &[Coordinates]) -> ServiceResult<RouteSummary> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(waypoints.to_vec());
        }
        if self.down {
            return Err(ServiceError::Unavailable("router down".to_string()));
        }
        let legs = waypoints.len().saturating_sub(1) as f64;
        Ok(RouteSummary {
            distance: 1000.0 * legs,
            duration: 360.0 * legs,
        })
    }
}

pub struct FakeObjects;

#[rocket::async_trait]
impl ObjectStore for FakeObjects {
    async fn upload(&self, owner: &str, extension: &str, _bytes: Vec<u8>) -> ServiceResult<String> {
        Ok(format!("/uploads/{}.{}", owner, extension))
    }
}
