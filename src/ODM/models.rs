//!
//! Documentation of the Models module.
//! Contains the ride, driver, chat and session records shared by the
//! coordinator, the collaborators and the routes, plus the MongoDB
//! document forms of the records that carry timestamps.
//!

use bson::DateTime as BsonDateTime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latitude / longitude pair, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Builds coordinates from loosely typed input, rejecting anything the
    /// map must never render (missing, NaN, out of range or the 0,0 origin)
    pub fn checked(lat: Option<f64>, lng: Option<f64>) -> Option<Self> {
        let coords = Self::new(lat?, lng?);
        if coords.is_plausible() {
            Some(coords)
        } else {
            None
        }
    }

    pub fn is_plausible(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat.abs() <= 90.0
            && self.lng.abs() <= 180.0
            && !(self.lat == 0.0 && self.lng == 0.0)
    }

    /// `geo` uses x = longitude, y = latitude
    pub fn to_point(&self) -> geo::Point<f64> {
        geo::Point::new(self.lng, self.lat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RideStatus {
    Pending,
    Accepted,
    OnTrip,
    Completed,
    Cancelled,
}

impl RideStatus {
    /// pending, accepted and on-trip rides block a new request
    pub fn is_active(&self) -> bool {
        matches!(self, RideStatus::Pending | RideStatus::Accepted | RideStatus::OnTrip)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Pending => "pending",
            RideStatus::Accepted => "accepted",
            RideStatus::OnTrip => "on-trip",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Passenger,
    Driver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
}

/// One passenger trip request and its status progression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRecord {
    pub ride_id: i64,
    pub passenger_id: String,
    pub driver_id: Option<String>,
    pub pickup_location: String,
    pub dropoff_location: String,
    pub pickup: Option<Coordinates>,
    pub dropoff: Option<Coordinates>,
    pub status: RideStatus,
    /// 0 until the driver finalizes the fare
    pub price: f64,
    pub rating: Option<u8>,
    pub review_text: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a passenger submits; the store assigns id, status and timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct NewRide {
    pub passenger_id: String,
    pub pickup_location: String,
    pub dropoff_location: String,
    pub pickup: Option<Coordinates>,
    pub dropoff: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub driver_id: String,
    pub status: DriverStatus,
    pub verification_status: VerificationStatus,
    pub last_status_change: Option<DateTime<Utc>>,
    pub current: Option<Coordinates>,
    pub location_accuracy: Option<f64>,
    pub last_location_update: Option<DateTime<Utc>>,
    pub pedicab_plate: Option<String>,
    pub registration_group: Option<String>,
}

impl DriverRecord {
    /// The published position, if the driver ever sent a usable one
    pub fn location(&self) -> Option<DriverLocation> {
        let coords = self.current.filter(|c| c.is_plausible())?;
        Some(DriverLocation {
            driver_id: self.driver_id.clone(),
            coords,
            accuracy: self.location_accuracy,
            updated_at: self.last_location_update,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverLocation {
    pub driver_id: String,
    pub coords: Coordinates,
    pub accuracy: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Public profile fields from the `users` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub fullname: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub preferred_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub ride_id: i64,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emergency {
    pub emergency_id: i64,
    pub user_id: String,
    pub ride_id: Option<i64>,
    pub kind: String,
    pub status: String,
    pub location: Coordinates,
    pub created_at: DateTime<Utc>,
}

/// An authenticated session, as issued by the auth service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub role: Role,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub preferred_color: Option<String>,
}

/*
Documents for the MongoDB collections, timestamps kept as BSON dates
*/
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideDocument {
    pub ride_id: i64,
    pub passenger_id: String,
    pub driver_id: Option<String>,
    pub pickup_location: String,
    pub dropoff_location: String,
    pub pickup: Option<Coordinates>,
    pub dropoff: Option<Coordinates>,
    pub status: RideStatus,
    pub price: f64,
    pub rating: Option<i32>,
    pub review_text: Option<String>,
    pub requested_at: BsonDateTime,
    pub updated_at: BsonDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverDocument {
    pub driver_id: String,
    pub status: DriverStatus,
    pub verification_status: VerificationStatus,
    pub last_status_change: Option<BsonDateTime>,
    pub current_lat: Option<f64>,
    pub current_lng: Option<f64>,
    pub location_accuracy: Option<f64>,
    pub last_location_update: Option<BsonDateTime>,
    pub pedicab_plate: Option<String>,
    pub registration_group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDocument {
    pub ride_id: i64,
    pub sender_id: String,
    pub content: String,
    pub created_at: BsonDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyDocument {
    pub emergency_id: i64,
    pub user_id: String,
    pub ride_id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub location_lat: f64,
    pub location_lng: f64,
    pub created_at: BsonDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub token: String,
    pub user_id: String,
    pub role: Role,
    pub email: String,
    pub expires_at: BsonDateTime,
}
