//!
//! Documentation of the services module.
//! The external collaborators the coordinator is written against: auth,
//! ride / driver / chat / emergency storage, change notifications,
//! geocoding, routing and object storage. MongoDB backs the stores
//! (see `ODM`), Nominatim and OSRM back geocoding and routing, and the
//! local upload directory backs object storage.
//!

pub mod nominatim;
pub mod osrm;
pub mod uploads;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ODM::models::*;

/// Collaborator failures, as seen from the coordinator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// Network or storage failure; retrying later may succeed
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Expired session or a storage policy rejection
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<reqwest::Error> for ServiceError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                ServiceError::Unauthorized(error.to_string())
            }
            _ => ServiceError::Unavailable(error.to_string()),
        }
    }
}

/// Whose rides a query or a subscription covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RideScope {
    Passenger(String),
    Driver(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    /// meters
    pub distance: f64,
    /// seconds
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeHit {
    pub coords: Coordinates,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub display_name: String,
    pub coords: Coordinates,
    /// km from the user, 0 when the user position is unknown
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEmergency {
    pub user_id: String,
    pub ride_id: Option<i64>,
    pub location: Coordinates,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProfileUpdate {
    pub fullname: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub preferred_color: Option<String>,
}

/// Push notifications for one subscription; closes when the transport gives up
pub type Notifications<T> = mpsc::Receiver<T>;

#[rocket::async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_session(&self, token: &str) -> ServiceResult<Option<Session>>;
    async fn sign_out(&self, token: &str) -> ServiceResult<()>;
}

#[rocket::async_trait]
pub trait RideStore: Send + Sync {
    async fn insert_ride(&self, ride: NewRide) -> ServiceResult<RideRecord>;
    async fn ride(&self, ride_id: i64) -> ServiceResult<Option<RideRecord>>;
    /// The active ride of the scope, else the most recently requested one
    async fn latest_ride(&self, scope: &RideScope) -> ServiceResult<Option<RideRecord>>;
    /// The ride of the scope in pending / accepted / on-trip, if any
    async fn active_ride(&self, scope: &RideScope) -> ServiceResult<Option<RideRecord>>;
    /// Cancels only while still pending and unassigned
    async fn cancel_ride(&self, ride_id: i64) -> ServiceResult<Option<RideRecord>>;
    async fn cancel_pending_for_passenger(&self, passenger_id: &str) -> ServiceResult<u64>;
    /// Assigns the driver only while the ride is still pending
    async fn accept_ride(&self, ride_id: i64, driver_id: &str) -> ServiceResult<Option<RideRecord>>;
    async fn start_trip(&self, ride_id: i64, driver_id: &str) -> ServiceResult<Option<RideRecord>>;
    async fn complete_ride(&self, ride_id: i64, driver_id: &str, price: f64) -> ServiceResult<Option<RideRecord>>;
    async fn rate_ride(&self, ride_id: i64, rating: u8, feedback: &str) -> ServiceResult<Option<RideRecord>>;
    /// Pending rides, newest request first
    async fn pending_rides(&self) -> ServiceResult<Vec<RideRecord>>;
    async fn newest_pending_id(&self) -> ServiceResult<Option<i64>>;
    async fn declined_ride_ids(&self, driver_id: &str) -> ServiceResult<Vec<i64>>;
    async fn decline_ride(&self, driver_id: &str, ride_id: i64) -> ServiceResult<()>;
    async fn trip_history(&self, passenger_id: &str, limit: i64) -> ServiceResult<Vec<RideRecord>>;
    async fn completed_by_driver_since(&self, driver_id: &str, since: DateTime<Utc>) -> ServiceResult<Vec<RideRecord>>;
}

#[rocket::async_trait]
pub trait DriverStore: Send + Sync {
    async fn driver(&self, driver_id: &str) -> ServiceResult<Option<DriverRecord>>;
    async fn set_status(&self, driver_id: &str, status: DriverStatus, at: DateTime<Utc>) -> ServiceResult<()>;
    async fn publish_location(&self, driver_id: &str, coords: Coordinates, accuracy: f64, at: DateTime<Utc>) -> ServiceResult<()>;
    async fn available_drivers(&self) -> ServiceResult<Vec<DriverRecord>>;
}

#[rocket::async_trait]
pub trait UserStore: Send + Sync {
    async fn profile(&self, user_id: &str) -> ServiceResult<Option<UserProfile>>;
    async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> ServiceResult<()>;
}

#[rocket::async_trait]
pub trait MessageStore: Send + Sync {
    async fn send_message(&self, ride_id: i64, sender_id: &str, content: &str) -> ServiceResult<ChatMessage>;
    /// Oldest first
    async fn messages(&self, ride_id: i64) -> ServiceResult<Vec<ChatMessage>>;
}

#[rocket::async_trait]
pub trait EmergencyStore: Send + Sync {
    async fn create_emergency(&self, emergency: NewEmergency) -> ServiceResult<Emergency>;
}

/// Push-style change notifications; no delivery guarantee is assumed
#[rocket::async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Inserts and updates of rides in the scope
    async fn ride_notifications(&self, scope: &RideScope) -> ServiceResult<Notifications<RideRecord>>;
    /// Inserts of pending rides, from any passenger
    async fn pending_ride_inserts(&self) -> ServiceResult<Notifications<RideRecord>>;
    async fn driver_updates(&self, driver_id: &str) -> ServiceResult<Notifications<DriverRecord>>;
}

#[rocket::async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> ServiceResult<Option<GeocodeHit>>;
    /// Prefers named places over raw street addresses
    async fn reverse_geocode(&self, at: Coordinates) -> ServiceResult<Option<String>>;
    async fn suggest(&self, query: &str, near: Option<Coordinates>) -> ServiceResult<Vec<Suggestion>>;
}

#[rocket::async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, waypoints: &[Coordinates]) -> ServiceResult<RouteSummary>;
}

#[rocket::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores the blob under a unique path derived from the owner and returns its public URL
    async fn upload(&self, owner: &str, extension: &str, bytes: Vec<u8>) -> ServiceResult<String>;
}

/// Every collaborator a session needs, cheap to clone
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthProvider>,
    pub rides: Arc<dyn RideStore>,
    pub drivers: Arc<dyn DriverStore>,
    pub users: Arc<dyn UserStore>,
    pub messages: Arc<dyn MessageStore>,
    pub emergencies: Arc<dyn EmergencyStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub geocoder: Arc<dyn Geocoder>,
    pub router: Arc<dyn Router>,
    pub objects: Arc<dyn ObjectStore>,
}
