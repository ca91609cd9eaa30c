//! What the browser renders: the derived ride view, one-shot effects and notices

use serde::{Deserialize, Serialize};

use crate::services::RouteSummary;
use crate::ODM::models::{Coordinates, DriverLocation, RideRecord, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassengerPhase {
    NoRide,
    Pending,
    Accepted,
    OnTrip,
    AwaitingRating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverPhase {
    Offline,
    Idle,
    ShowingRequests,
    /// Accepted or on-trip; the ride status tells which
    OnTrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Phase {
    Passenger(PassengerPhase),
    Driver(DriverPhase),
}

/// Screens of the app; only home and map carry a map surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Home,
    Map,
    History,
    Profile,
}

impl View {
    pub fn surface(&self) -> Option<(&'static str, &'static str)> {
        match self {
            View::Home => Some(("home", "map-home")),
            View::Map => Some(("full", "map-full")),
            View::History | View::Profile => None,
        }
    }

    pub fn parse(name: &str) -> Option<View> {
        match name {
            "home" => Some(View::Home),
            "map" => Some(View::Map),
            "history" => Some(View::History),
            "profile" => Some(View::Profile),
            _ => None,
        }
    }
}

/// Fire-once UI effects, drained by the browser
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "kebab-case")]
pub enum UiEffect {
    /// A driver accepted the passenger's pending ride
    Matched { ride_id: i64 },
    TripCompleted { ride_id: i64 },
    CompletionScreen { ride: RideRecord },
    NewRequest { count: usize },
    SosRaised { emergency_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub message: String,
    pub dismissible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRideView {
    pub role: Role,
    pub phase: Phase,
    pub view: View,
    pub ride: Option<RideRecord>,
    pub counterpart: Option<DriverLocation>,
    /// km between the counterpart and where they are heading
    pub distance_km: Option<f64>,
    pub eta_minutes: Option<f64>,
    pub route: Option<RouteSummary>,
    pub self_position: Coordinates,
    pub low_confidence: bool,
    pub pending_requests: Vec<RideRecord>,
    pub can_request: bool,
    pub can_cancel: bool,
    pub chat_available: bool,
    pub driver_online: bool,
    pub fatigue_warning: bool,
}

/// A spot on the map with the address it reverse geocodes to, if any
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinnedPlace {
    pub coords: Coordinates,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Earnings {
    pub count: usize,
    pub total: f64,
}
