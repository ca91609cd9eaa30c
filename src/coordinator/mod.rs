//!
//! Documentation of the coordinator module.
//! The ride lifecycle coordinator of one signed in session. It owns the
//! session's map, position watch and change subscriptions, reconciles the
//! local view of the ride against every observation the bridge delivers and
//! turns user actions into store writes.
//!
//! Passenger: `NoRide -> Pending -> Accepted -> OnTrip -> AwaitingRating -> NoRide`,
//! and `Pending -> Cancelled -> NoRide`.
//!
//! Driver: `Offline -> Idle <-> ShowingRequests -> OnTrip -> Idle | Offline`.
//!
//! Collaborator failures never touch the derived state. Background failures
//! become notices; failures of a user action are returned to the caller.
//!

pub mod error;
pub mod view;
mod driver;
mod passenger;


use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::bridge::{BridgeEvent, Origin, RealtimeChangeBridge, RideObservation, Subscription};
use crate::config::config::ConfyConfig;
use crate::geo_source::{haversine_km, Fix, FixPolicy, GeoPositionSource, PositionSample, WatchHandle};
use crate::map_sync::{MapConfig, MapSyncEngine, MarkerKind, MarkerVisual, SurfaceSet};
use crate::services::{Collaborators, NewEmergency, ProfileUpdate, RideScope, RouteSummary, ServiceError, Suggestion};
use crate::ODM::models::*;
pub use error::{CoordinatorError, CoordinatorResult, SIGN_IN_AGAIN};
pub use passenger::{RideRequest, ACTIVE_RIDE_CONFLICT};
pub use driver::NOT_VERIFIED;
pub use view::*;

/// Minutes per km, what a pedicab manages in town traffic
const ETA_MINUTES_PER_KM: f64 = 6.0;
const SURFACE_ZOOM: f64 = 15.0;
const SELF_MARKER: &str = "self";
const PICKUP_MARKER: &str = "pickup";
const DESTINATION_MARKER: &str = "destination";

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub ride_poll: Duration,
    pub pending_poll: Duration,
    pub best_effort_timeout: Duration,
    pub high_confidence_timeout: Duration,
    pub high_confidence_accuracy: f64,
    pub default_location: Coordinates,
    pub route_refresh_meters: f64,
    pub fatigue_hours: i64,
    pub map: MapConfig,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorSettings::from(&ConfyConfig::default())
    }
}

impl From<&ConfyConfig> for CoordinatorSettings {
    fn from(config: &ConfyConfig) -> Self {
        Self {
            ride_poll: Duration::from_secs(config.ride_poll_secs),
            pending_poll: Duration::from_secs(config.pending_poll_secs),
            best_effort_timeout: Duration::from_millis(config.best_effort_timeout_ms),
            high_confidence_timeout: Duration::from_millis(config.high_confidence_timeout_ms),
            high_confidence_accuracy: config.high_confidence_accuracy,
            default_location: Coordinates::new(config.default_lat, config.default_lng),
            route_refresh_meters: config.route_refresh_meters,
            fatigue_hours: config.fatigue_hours,
            map: MapConfig {
                jitter_meters: config.jitter_meters,
                snap_meters: config.snap_meters,
                degenerate_span_km: config.degenerate_span_km,
                ..MapConfig::default()
            },
        }
    }
}

impl CoordinatorSettings {
    pub fn high_confidence(&self) -> FixPolicy {
        FixPolicy::HighConfidence {
            target_accuracy: self.high_confidence_accuracy,
            timeout: self.high_confidence_timeout,
        }
    }

    pub fn best_effort(&self) -> FixPolicy {
        FixPolicy::BestEffort {
            timeout: self.best_effort_timeout,
        }
    }
}

/// Everything the session's pump task feeds into the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Bridge(BridgeEvent),
    Position(PositionSample),
    /// The start-up fix found nothing
    FixUnavailable,
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

pub struct RideLifecycleCoordinator {
    session: Session,
    services: Collaborators,
    bridge: RealtimeChangeBridge,
    geo: GeoPositionSource,
    map: MapSyncEngine,
    settings: CoordinatorSettings,
    events: EventSender,

    latest: Option<RideRecord>,
    applied_seq: u64,
    last_status: Option<(i64, RideStatus)>,
    completion_shown: HashSet<i64>,
    completion_dismissed: HashSet<i64>,

    self_fix: Option<PositionSample>,
    low_confidence: bool,
    counterpart: Option<DriverLocation>,
    pending: Vec<RideRecord>,
    driver: Option<DriverRecord>,
    route_summary: Option<RouteSummary>,

    effects: Vec<UiEffect>,
    notices: Vec<Notice>,
    next_notice: u64,
    view: View,

    watch: Option<WatchHandle>,
    ride_sub: Option<Subscription>,
    location_sub: Option<(String, Subscription)>,
    pending_sub: Option<Subscription>,
}

impl RideLifecycleCoordinator {
    pub fn new(
        session: Session,
        services: Collaborators,
        geo: GeoPositionSource,
        settings: CoordinatorSettings,
        events: EventSender,
    ) -> Self {
        let bridge = RealtimeChangeBridge::new(
            services.rides.clone(),
            services.feed.clone(),
            settings.ride_poll,
            settings.pending_poll,
        );
        let map = MapSyncEngine::new(settings.map.clone());

        Self {
            session,
            services,
            bridge,
            geo,
            map,
            settings,
            events,
            latest: None,
            applied_seq: 0,
            last_status: None,
            completion_shown: HashSet::new(),
            completion_dismissed: HashSet::new(),
            self_fix: None,
            low_confidence: true,
            counterpart: None,
            pending: vec![],
            driver: None,
            route_summary: None,
            effects: vec![],
            notices: vec![],
            next_notice: 1,
            view: View::Home,
            watch: None,
            ride_sub: None,
            location_sub: None,
            pending_sub: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn map(&self) -> &MapSyncEngine {
        &self.map
    }

    fn role(&self) -> Role {
        self.session.role
    }

    fn scope(&self) -> RideScope {
        match self.role() {
            Role::Passenger => RideScope::Passenger(self.session.user_id.clone()),
            Role::Driver => RideScope::Driver(self.session.user_id.clone()),
        }
    }

    /// Loads the session's state, subscribes to changes and shows the home view
    pub async fn start(&mut self) {
        info!("Starting {:?} session for {}", self.role(), self.session.user_id);

        let sink = self.sink();
        self.ride_sub = Some(self.bridge.subscribe_ride_changes(self.scope(), sink));
        self.switch_view(View::Home).await;
        self.refresh().await;
    }

    /// Re-reads the authoritative state and re-derives everything from it
    pub async fn refresh(&mut self) {
        let seq = self.bridge.next_seq();
        match self.services.rides.latest_ride(&self.scope()).await {
            Ok(ride) => self.apply(RideObservation {
                seq,
                ride,
                origin: Origin::Local,
            }),
            Err(e) => self.background_failure("Could not load your ride", e),
        }

        if self.role() == Role::Driver {
            match self.services.drivers.driver(&self.session.user_id).await {
                Ok(record) => self.driver = record,
                Err(e) => self.background_failure("Could not load your driver profile", e),
            }
            if self.driver_online() && !self.has_active_ride() {
                self.load_pending().await;
            }
        }

        self.sync_subscriptions().await;
        self.render().await;
    }

    pub async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Bridge(BridgeEvent::RideChanged(observation)) => {
                self.apply(observation);
                self.after_ride_change().await;
            }
            SessionEvent::Bridge(BridgeEvent::DriverMoved(location)) => {
                if self.counterpart_id().as_deref() == Some(location.driver_id.as_str()) {
                    self.counterpart = Some(location);
                    self.render().await;
                }
            }
            SessionEvent::Bridge(BridgeEvent::PendingRides(batch)) => {
                if !self.driver_online() || self.has_active_ride() {
                    debug!("Ignoring {} pending rides while not taking requests", batch.rides.len());
                    return;
                }
                if batch.fresh && !batch.rides.is_empty() {
                    self.effects.push(UiEffect::NewRequest {
                        count: batch.rides.len(),
                    });
                }
                self.pending = batch.rides;
                self.render().await;
            }
            SessionEvent::Position(sample) => self.on_position(sample).await,
            SessionEvent::FixUnavailable => {
                if self.self_fix.is_none() {
                    self.low_confidence = true;
                    self.notify(NoticeLevel::Info, "Location unavailable, showing an approximate position.");
                }
            }
        }
    }

    /// Whether an observation may replace what is currently shown
    fn is_fresh(&self, observation: &RideObservation) -> bool {
        match (&self.latest, &observation.ride) {
            (_, None) => observation.seq > self.applied_seq,
            (None, Some(_)) => true,
            // writes to an older, finished ride never hide the one in progress
            (Some(current), Some(seen))
                if current.status.is_active()
                    && seen.ride_id != current.ride_id
                    && !seen.status.is_active()
                    && seen.requested_at <= current.requested_at =>
            {
                false
            }
            (Some(current), Some(seen)) => {
                seen.updated_at > current.updated_at
                    || (seen.updated_at == current.updated_at
                        && (seen.ride_id == current.ride_id || observation.seq > self.applied_seq))
            }
        }
    }

    fn apply(&mut self, observation: RideObservation) {
        if !self.is_fresh(&observation) {
            debug!(
                "Discarding stale {:?} observation #{} of ride {:?}",
                observation.origin,
                observation.seq,
                observation.ride.as_ref().map(|r| r.ride_id)
            );
            return;
        }
        self.applied_seq = self.applied_seq.max(observation.seq);

        let previous = self.last_status;
        self.latest = observation.ride;
        self.last_status = self.latest.as_ref().map(|r| (r.ride_id, r.status));
        self.on_transition(previous);
    }

    /// Edge-triggered effects, from the previously observed status to the current one
    fn on_transition(&mut self, previous: Option<(i64, RideStatus)>) {
        let (ride_id, status, rated) = match &self.latest {
            Some(ride) => (ride.ride_id, ride.status, ride.rating.is_some()),
            None => return,
        };
        let before = previous.filter(|(id, _)| *id == ride_id).map(|(_, s)| s);
        if before == Some(status) {
            return;
        }
        debug!("Ride {} moved from {:?} to {:?}", ride_id, before, status);

        if self.role() == Role::Passenger {
            if before == Some(RideStatus::Pending) && status == RideStatus::Accepted {
                self.effects.push(UiEffect::Matched { ride_id });
            }
            if status == RideStatus::Completed {
                if before.map(|s| s.is_active()).unwrap_or(false) {
                    self.effects.push(UiEffect::TripCompleted { ride_id });
                }
                if !rated && self.completion_shown.insert(ride_id) {
                    if let Some(ride) = self.latest.clone() {
                        self.effects.push(UiEffect::CompletionScreen { ride });
                    }
                }
            }
        }

        if status != RideStatus::Accepted && status != RideStatus::OnTrip {
            self.route_summary = None;
        }
    }

    async fn after_ride_change(&mut self) {
        if self.role() == Role::Driver && self.driver_online() && !self.has_active_ride() && self.pending.is_empty() {
            self.load_pending().await;
        }
        self.sync_subscriptions().await;
        self.render().await;
    }

    pub fn phase(&self) -> Phase {
        match self.role() {
            Role::Passenger => Phase::Passenger(match &self.latest {
                None => PassengerPhase::NoRide,
                Some(ride) => match ride.status {
                    RideStatus::Pending => PassengerPhase::Pending,
                    RideStatus::Accepted => PassengerPhase::Accepted,
                    RideStatus::OnTrip => PassengerPhase::OnTrip,
                    RideStatus::Completed
                        if ride.rating.is_none() && !self.completion_dismissed.contains(&ride.ride_id) =>
                    {
                        PassengerPhase::AwaitingRating
                    }
                    RideStatus::Completed | RideStatus::Cancelled => PassengerPhase::NoRide,
                },
            }),
            Role::Driver => Phase::Driver(if self.has_active_ride() {
                DriverPhase::OnTrip
            } else if !self.driver_online() {
                DriverPhase::Offline
            } else if self.pending.is_empty() {
                DriverPhase::Idle
            } else {
                DriverPhase::ShowingRequests
            }),
        }
    }

    fn active_ride(&self) -> Option<&RideRecord> {
        self.latest.as_ref().filter(|r| r.status.is_active())
    }

    fn has_active_ride(&self) -> bool {
        self.active_ride().is_some()
    }

    fn driver_online(&self) -> bool {
        self.driver.as_ref().map(|d| d.status == DriverStatus::Online).unwrap_or(false)
    }

    /// The driver a passenger is matched with
    fn counterpart_id(&self) -> Option<String> {
        if self.role() != Role::Passenger {
            return None;
        }
        self.latest
            .as_ref()
            .filter(|r| matches!(r.status, RideStatus::Accepted | RideStatus::OnTrip))
            .and_then(|r| r.driver_id.clone())
    }

    pub fn self_position(&self) -> Coordinates {
        self.self_fix
            .as_ref()
            .map(|f| f.coords)
            .unwrap_or(self.settings.default_location)
    }

    fn sink(&self) -> impl Fn(BridgeEvent) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event| {
            // the pump is gone once the session ends
            let _ = events.send(SessionEvent::Bridge(event));
        }
    }

    /// Starts and stops the location and pending subscriptions the current state needs
    async fn sync_subscriptions(&mut self) {
        match self.counterpart_id() {
            Some(driver_id) => {
                let current = self.location_sub.as_ref().map(|(id, _)| id.as_str());
                if current != Some(driver_id.as_str()) {
                    let subscription = self.bridge.subscribe_driver_location(&driver_id, self.sink());
                    self.location_sub = Some((driver_id.clone(), subscription));
                    self.counterpart = match self.services.drivers.driver(&driver_id).await {
                        Ok(record) => record.and_then(|r| r.location()),
                        Err(e) => {
                            self.background_failure("Could not locate your driver", e);
                            None
                        }
                    };
                }
            }
            None => {
                if self.location_sub.take().is_some() {
                    debug!("Dropped the driver location subscription");
                }
                self.counterpart = None;
            }
        }

        if self.role() == Role::Driver {
            if self.driver_online() {
                if self.pending_sub.is_none() {
                    let subscription = self.bridge.subscribe_new_pending_rides(&self.session.user_id, self.sink());
                    self.pending_sub = Some(subscription);
                }
            } else {
                self.pending_sub = None;
                self.pending.clear();
            }
        }
    }

    async fn load_pending(&mut self) {
        let pending = match self.services.rides.pending_rides().await {
            Ok(pending) => pending,
            Err(e) => return self.background_failure("Could not load ride requests", e),
        };
        let declined = match self.services.rides.declined_ride_ids(&self.session.user_id).await {
            Ok(declined) => declined,
            Err(e) => return self.background_failure("Could not load ride requests", e),
        };
        self.pending = pending
            .into_iter()
            .filter(|r| !declined.contains(&r.ride_id))
            .collect();
    }

    async fn on_position(&mut self, sample: PositionSample) {
        let coords = sample.coords;
        let accuracy = sample.accuracy;
        self.low_confidence = accuracy > self.settings.high_confidence_accuracy;
        self.self_fix = Some(sample);

        if self.role() == Role::Driver && self.driver_online() {
            if let Err(e) = self
                .services
                .drivers
                .publish_location(&self.session.user_id, coords, accuracy, Utc::now())
                .await
            {
                self.background_failure("Could not share your location", e);
            }
        }
        self.render().await;
    }

    /// Locates the user for a one-off action, falling back to the last fix or the default
    async fn best_position(&self) -> (Coordinates, bool) {
        if let Some(fix) = &self.self_fix {
            if !self.low_confidence {
                return (fix.coords, false);
            }
        }
        match self.geo.current_position(self.settings.best_effort()).await {
            Fix::Position(sample) => (sample.coords, false),
            Fix::Unavailable => (self.self_position(), true),
        }
    }

    /// Tears down the previous view's watch and surface, then sets up the next
    pub async fn switch_view(&mut self, view: View) {
        GeoPositionSource::stop(self.watch.as_mut());
        self.watch = None;
        if let Some((name, _)) = self.view.surface() {
            self.map.destroy_surface(name);
        }

        self.view = view;
        if let Some((name, viewport_id)) = view.surface() {
            self.map.register_surface(name, viewport_id, self.self_position(), SURFACE_ZOOM);
            let events = self.events.clone();
            self.watch = Some(self.geo.watch(move |sample| {
                let _ = events.send(SessionEvent::Position(sample));
            }));
            self.render().await;
        }
    }

    pub fn current_view(&self) -> View {
        self.view
    }

    /// Issues the map commands of the current phase
    async fn render(&mut self) {
        if self.view.surface().is_none() {
            return;
        }
        let all = SurfaceSet::All;
        let mut self_visual = MarkerVisual::new("You", "self").with_accent(self.session.preferred_color.clone());
        if self.low_confidence {
            self_visual = self_visual.with_popup("Approximate location".to_string());
        }
        self.map.upsert_marker(&all, SELF_MARKER, MarkerKind::SelfPosition, Some(self.self_position()), self_visual);

        match self.phase() {
            Phase::Passenger(PassengerPhase::Pending) => {
                self.show_ride_ends(true, true);
                self.keep_only(&[SELF_MARKER, PICKUP_MARKER, DESTINATION_MARKER]);
                self.map.clear_route(&all);
            }
            Phase::Passenger(PassengerPhase::Accepted) | Phase::Passenger(PassengerPhase::OnTrip) => {
                self.show_ride_ends(false, true);
                let counterpart_marker = self.counterpart_marker();
                if let (Some(location), Some(id)) = (self.counterpart.clone(), counterpart_marker.clone()) {
                    let visual = MarkerVisual::new("Your driver", "pedicab")
                        .with_popup(format!("Driver {}", location.driver_id));
                    self.map.upsert_marker(&all, &id, MarkerKind::Counterpart, Some(location.coords), visual);
                }
                let keep: Vec<&str> = [Some(SELF_MARKER), Some(DESTINATION_MARKER), counterpart_marker.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect();
                self.keep_only(&keep);
                self.map.clear_route(&all);
                self.map.fit_to_markers(&all);
            }
            Phase::Driver(DriverPhase::OnTrip) => {
                self.show_ride_ends(true, true);
                self.keep_only(&[SELF_MARKER, PICKUP_MARKER, DESTINATION_MARKER]);
                self.draw_trip_route().await;
                self.map.fit_to_markers(&all);
            }
            Phase::Driver(DriverPhase::Idle) | Phase::Driver(DriverPhase::ShowingRequests) => {
                let requests = self.pending.clone();
                for ride in &requests {
                    let visual = MarkerVisual::new("Ride request", "request")
                        .with_popup(format!("{} to {}", ride.pickup_location, ride.dropoff_location));
                    self.map.upsert_marker(
                        &all,
                        &format!("request-{}", ride.ride_id),
                        MarkerKind::PendingRequest,
                        ride.pickup,
                        visual,
                    );
                }
                let ids: HashSet<String> = requests.iter().map(|r| format!("request-{}", r.ride_id)).collect();
                self.map.retain_markers(&all, |m| {
                    m.kind == MarkerKind::SelfPosition || m.kind == MarkerKind::Sos || ids.contains(&m.id)
                });
                self.map.clear_route(&all);
            }
            Phase::Passenger(PassengerPhase::NoRide)
            | Phase::Passenger(PassengerPhase::AwaitingRating)
            | Phase::Driver(DriverPhase::Offline) => {
                self.map
                    .retain_markers(&all, |m| m.kind == MarkerKind::SelfPosition || m.kind == MarkerKind::Sos);
                self.map.clear_route(&all);
            }
        }
    }

    fn counterpart_marker(&self) -> Option<String> {
        self.counterpart_id().map(|id| format!("driver-{}", id))
    }

    fn keep_only(&mut self, ids: &[&str]) {
        self.map
            .retain_markers(&SurfaceSet::All, |m| m.kind == MarkerKind::Sos || ids.contains(&m.id.as_str()));
    }

    fn show_ride_ends(&mut self, pickup: bool, destination: bool) {
        let ride = match &self.latest {
            Some(ride) => ride.clone(),
            None => return,
        };
        let all = SurfaceSet::All;
        if pickup {
            let visual = MarkerVisual::new("Pickup", "pickup").with_popup(ride.pickup_location.clone());
            self.map.upsert_marker(&all, PICKUP_MARKER, MarkerKind::Pickup, ride.pickup, visual);
        }
        if destination {
            let visual = MarkerVisual::new("Drop-off", "destination").with_popup(ride.dropoff_location.clone());
            self.map.upsert_marker(&all, DESTINATION_MARKER, MarkerKind::Destination, ride.dropoff, visual);
        }
    }

    /// Self, then pickup while still heading there, then drop-off
    async fn draw_trip_route(&mut self) {
        let ride = match self.active_ride() {
            Some(ride) => ride.clone(),
            None => return,
        };
        let pickup = if ride.status == RideStatus::Accepted { ride.pickup } else { None };
        let waypoints = [Some(self.self_position()), pickup, ride.dropoff];

        let all = SurfaceSet::All;
        if !self.map.route_is_stale(&all, &waypoints, self.settings.route_refresh_meters) {
            return;
        }
        let router = self.services.router.clone();
        if let Some(summary) = self.map.draw_route(router.as_ref(), &all, &waypoints).await {
            self.route_summary = Some(summary);
        }
    }

    /// Distance and ETA of the counterpart to where they are heading
    fn counterpart_progress(&self) -> (Option<f64>, Option<f64>) {
        let ride = match self.active_ride() {
            Some(ride) => ride,
            None => return (None, None),
        };
        match self.role() {
            Role::Passenger => {
                let driver = match &self.counterpart {
                    Some(location) => location.coords,
                    None => return (None, None),
                };
                let target = match ride.status {
                    RideStatus::OnTrip => ride.dropoff,
                    _ => self.self_fix.as_ref().map(|f| f.coords).or(ride.pickup),
                };
                match target {
                    Some(target) => {
                        let km = haversine_km(driver, target);
                        (Some(km), Some(km * ETA_MINUTES_PER_KM))
                    }
                    None => (None, None),
                }
            }
            Role::Driver => match self.route_summary {
                Some(summary) => (Some(summary.distance / 1000.0), Some(summary.duration / 60.0)),
                None => (None, None),
            },
        }
    }

    pub fn view(&self) -> ActiveRideView {
        let (distance_km, eta_minutes) = self.counterpart_progress();
        let phase = self.phase();
        let ride = match phase {
            Phase::Passenger(PassengerPhase::NoRide) => None,
            _ => self.latest.clone().filter(|r| r.status != RideStatus::Cancelled),
        };
        let fatigue_warning = self.driver_online()
            && self
                .driver
                .as_ref()
                .and_then(|d| d.last_status_change)
                .map(|since| Utc::now() - since >= chrono::Duration::hours(self.settings.fatigue_hours))
                .unwrap_or(false);

        ActiveRideView {
            role: self.role(),
            phase,
            view: self.view,
            ride,
            counterpart: self.counterpart.clone(),
            distance_km,
            eta_minutes,
            route: self.route_summary,
            self_position: self.self_position(),
            low_confidence: self.low_confidence,
            pending_requests: if phase == Phase::Driver(DriverPhase::ShowingRequests) {
                self.pending.clone()
            } else {
                vec![]
            },
            can_request: self.role() == Role::Passenger && !self.has_active_ride(),
            can_cancel: self
                .active_ride()
                .map(|r| self.role() == Role::Passenger && r.status == RideStatus::Pending && r.driver_id.is_none())
                .unwrap_or(false),
            chat_available: self
                .active_ride()
                .map(|r| r.status != RideStatus::Pending)
                .unwrap_or(false),
            driver_online: self.driver_online(),
            fatigue_warning,
        }
    }

    pub fn take_effects(&mut self) -> Vec<UiEffect> {
        std::mem::take(&mut self.effects)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn notify(&mut self, level: NoticeLevel, message: &str) {
        if self.notices.iter().any(|n| n.message == message) {
            return;
        }
        self.notices.push(Notice {
            id: self.next_notice,
            level,
            message: message.to_string(),
            dismissible: true,
        });
        self.next_notice += 1;
    }

    /// Logs a failure outside a user action and queues a notice for it
    fn background_failure(&mut self, what: &str, error: ServiceError) {
        warn!("{}: {}", what, error);
        match error {
            ServiceError::Unauthorized(_) => self.notify(NoticeLevel::Error, SIGN_IN_AGAIN),
            _ => self.notify(NoticeLevel::Warning, &format!("{}. Retrying shortly.", what)),
        }
    }

    /// Applies the result of the session's own write
    fn apply_local(&mut self, ride: RideRecord) {
        let seq = self.bridge.next_seq();
        self.apply(RideObservation {
            seq,
            ride: Some(ride),
            origin: Origin::Local,
        });
    }

    fn ensure_role(&self, role: Role, action: &str) -> CoordinatorResult<()> {
        if self.role() == role {
            return Ok(());
        }
        let who = match role {
            Role::Passenger => "passengers",
            Role::Driver => "drivers",
        };
        Err(CoordinatorError::Refused(format!("Only {} can {}.", who, action)))
    }

    pub async fn send_message(&mut self, ride_id: i64, content: &str) -> CoordinatorResult<ChatMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CoordinatorError::Invalid("Type a message first.".to_string()));
        }
        self.chat_ride(ride_id)?;
        let message = self
            .services
            .messages
            .send_message(ride_id, &self.session.user_id, content)
            .await?;
        Ok(message)
    }

    pub async fn messages(&self, ride_id: i64) -> CoordinatorResult<Vec<ChatMessage>> {
        self.chat_ride(ride_id)?;
        Ok(self.services.messages.messages(ride_id).await?)
    }

    /// Chat belongs to the session's accepted or on-trip ride only
    fn chat_ride(&self, ride_id: i64) -> CoordinatorResult<()> {
        match self.active_ride().filter(|r| r.status != RideStatus::Pending) {
            Some(ride) if ride.ride_id == ride_id => Ok(()),
            Some(_) => Err(CoordinatorError::Refused("This is not your current ride.".to_string())),
            None => Err(CoordinatorError::Refused("Chat opens once a driver accepts the ride.".to_string())),
        }
    }

    /// Raises an emergency at the best position available right now
    pub async fn trigger_sos(&mut self) -> CoordinatorResult<Emergency> {
        let (location, approximate) = self.best_position().await;
        let ride_id = self.active_ride().map(|r| r.ride_id);
        let emergency = self
            .services
            .emergencies
            .create_emergency(NewEmergency {
                user_id: self.session.user_id.clone(),
                ride_id,
                location,
            })
            .await?;

        warn!("SOS {} raised by {} on ride {:?}", emergency.emergency_id, self.session.user_id, ride_id);
        let mut visual = MarkerVisual::new("SOS", "sos");
        if approximate {
            visual = visual.with_popup("Approximate location".to_string());
        }
        self.map.upsert_marker(
            &SurfaceSet::All,
            &format!("sos-{}", emergency.emergency_id),
            MarkerKind::Sos,
            Some(location),
            visual,
        );
        self.effects.push(UiEffect::SosRaised {
            emergency_id: emergency.emergency_id,
        });
        Ok(emergency)
    }

    pub async fn suggest(&self, query: &str) -> CoordinatorResult<Vec<Suggestion>> {
        let near = self.self_fix.as_ref().map(|f| f.coords);
        Ok(self.services.geocoder.suggest(query, near).await?)
    }

    /// Names a dropped pin, or the user's own fix when no pin is given.
    /// A failed lookup still returns the spot, without an address.
    pub async fn place_at(&self, pin: Option<Coordinates>) -> CoordinatorResult<PinnedPlace> {
        let coords = match pin {
            Some(pin) if pin.is_plausible() => pin,
            Some(_) => return Err(CoordinatorError::Invalid("That spot is not on the map.".to_string())),
            None => match self.self_fix.as_ref() {
                Some(fix) => fix.coords,
                None => {
                    return Err(CoordinatorError::Refused(
                        "Could not determine location. Please enter manually.".to_string(),
                    ))
                }
            },
        };
        let address = match self.services.geocoder.reverse_geocode(coords).await {
            Ok(address) => address,
            Err(e) => {
                warn!("Reverse geocoding {:?} failed: {}", coords, e);
                None
            }
        };
        Ok(PinnedPlace { coords, address })
    }

    pub async fn available_drivers(&self) -> CoordinatorResult<Vec<DriverRecord>> {
        Ok(self.services.drivers.available_drivers().await?)
    }

    /// Saves the profile and, when given, the new avatar
    pub async fn update_profile(
        &mut self,
        fullname: &str,
        phone: Option<String>,
        preferred_color: Option<String>,
        avatar: Option<(String, Vec<u8>)>,
    ) -> CoordinatorResult<UserProfile> {
        let fullname = fullname.trim();
        if fullname.is_empty() {
            return Err(CoordinatorError::Invalid("Please enter your name.".to_string()));
        }
        let avatar_url = match avatar {
            Some((extension, bytes)) => Some(
                self.services
                    .objects
                    .upload(&self.session.user_id, &extension, bytes)
                    .await?,
            ),
            None => None,
        };

        let update = ProfileUpdate {
            fullname: fullname.to_string(),
            phone: phone.clone(),
            avatar_url: avatar_url.clone(),
            preferred_color: preferred_color.clone(),
        };
        self.services.users.update_profile(&self.session.user_id, update).await?;

        self.session.display_name = fullname.to_string();
        self.session.phone = phone.clone();
        self.session.preferred_color = preferred_color.clone();
        if avatar_url.is_some() {
            self.session.avatar_url = avatar_url;
        }
        self.render().await;

        Ok(UserProfile {
            user_id: self.session.user_id.clone(),
            fullname: fullname.to_string(),
            phone,
            avatar_url: self.session.avatar_url.clone(),
            preferred_color,
        })
    }

    /// Releases every watch, subscription and surface of the session
    pub async fn shutdown(&mut self) {
        GeoPositionSource::stop(self.watch.as_mut());
        self.watch = None;
        self.ride_sub = None;
        self.location_sub = None;
        self.pending_sub = None;
        for name in self.map.surface_names() {
            self.map.destroy_surface(&name);
        }
        info!("Session of {} shut down", self.session.user_id);
    }
}
