//! Passenger actions

use log::{info, warn};
use serde::Deserialize;

use super::*;

/// What the request form submits. Coordinates are only sent when they come
/// from a GPS lock or a map pin, and are then trusted as they are.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RideRequest {
    pub pickup: String,
    pub dropoff: String,
    pub pickup_coords: Option<Coordinates>,
    pub dropoff_coords: Option<Coordinates>,
}

pub const ACTIVE_RIDE_CONFLICT: &str = "You already have an active request or trip!";

impl RideLifecycleCoordinator {
    /// Requests a ride, refusing when the passenger already has one going
    pub async fn request_ride(&mut self, request: RideRequest) -> CoordinatorResult<RideRecord> {
        self.ensure_role(Role::Passenger, "request rides")?;
        let pickup = request.pickup.trim();
        let dropoff = request.dropoff.trim();
        if pickup.is_empty() || dropoff.is_empty() {
            return Err(CoordinatorError::Invalid(
                "Please enter both pickup and drop-off locations.".to_string(),
            ));
        }

        // Not atomic with the insert below, two racing requests can both pass
        if let Some(active) = self.services.rides.active_ride(&self.scope()).await? {
            info!("Passenger {} already has ride {} in progress", self.session.user_id, active.ride_id);
            return Err(CoordinatorError::Conflict(ACTIVE_RIDE_CONFLICT.to_string()));
        }

        let pickup_coords = self.resolve(pickup, request.pickup_coords).await;
        let dropoff_coords = self.resolve(dropoff, request.dropoff_coords).await;

        let ride = self
            .services
            .rides
            .insert_ride(NewRide {
                passenger_id: self.session.user_id.clone(),
                pickup_location: pickup.to_string(),
                dropoff_location: dropoff.to_string(),
                pickup: pickup_coords,
                dropoff: dropoff_coords,
            })
            .await?;
        info!("Ride {} requested by {}", ride.ride_id, self.session.user_id);

        self.apply_local(ride.clone());
        self.after_ride_change().await;
        Ok(ride)
    }

    /// Trusted coordinates win, else the address is geocoded. A failed lookup is not fatal.
    async fn resolve(&self, address: &str, trusted: Option<Coordinates>) -> Option<Coordinates> {
        if let Some(coords) = trusted.filter(|c| c.is_plausible()) {
            return Some(coords);
        }
        match self.services.geocoder.geocode(address).await {
            Ok(hit) => hit.map(|h| h.coords).filter(|c| c.is_plausible()),
            Err(e) => {
                warn!("Geocoding {} failed, requesting without coordinates: {}", address, e);
                None
            }
        }
    }

    /// Cancels while the ride is still waiting for a driver
    pub async fn cancel_ride(&mut self, ride_id: i64) -> CoordinatorResult<RideRecord> {
        self.ensure_role(Role::Passenger, "cancel rides")?;
        let ride = self
            .services
            .rides
            .ride(ride_id)
            .await?
            .filter(|r| r.passenger_id == self.session.user_id)
            .ok_or_else(|| CoordinatorError::Invalid("Ride not found.".to_string()))?;

        let refused = || CoordinatorError::Refused("This ride can no longer be cancelled.".to_string());
        if ride.status != RideStatus::Pending || ride.driver_id.is_some() {
            return Err(refused());
        }

        // a driver may have accepted since the read above
        let cancelled = self.services.rides.cancel_ride(ride_id).await?.ok_or_else(refused)?;
        info!("Ride {} cancelled by {}", ride_id, self.session.user_id);
        self.apply_local(cancelled.clone());
        self.after_ride_change().await;
        Ok(cancelled)
    }

    /// Cancels every pending request of the passenger. Returns how many were cancelled.
    pub async fn cancel_all_pending(&mut self) -> CoordinatorResult<u64> {
        self.ensure_role(Role::Passenger, "cancel rides")?;
        if let Some(active) = self.services.rides.active_ride(&self.scope()).await? {
            if active.status != RideStatus::Pending {
                return Err(CoordinatorError::Refused(
                    "You have a ride in progress, it cannot be reset.".to_string(),
                ));
            }
        }
        let count = self
            .services
            .rides
            .cancel_pending_for_passenger(&self.session.user_id)
            .await?;
        info!("Cancelled {} pending requests of {}", count, self.session.user_id);
        self.refresh().await;
        Ok(count)
    }

    /// Rates a completed ride with 1 to 5 stars
    pub async fn rate_ride(&mut self, ride_id: i64, stars: u8, feedback: &str) -> CoordinatorResult<RideRecord> {
        self.ensure_role(Role::Passenger, "rate rides")?;
        if !(1..=5).contains(&stars) {
            return Err(CoordinatorError::Invalid("Please choose from 1 to 5 stars.".to_string()));
        }
        let ride = self
            .services
            .rides
            .ride(ride_id)
            .await?
            .filter(|r| r.passenger_id == self.session.user_id)
            .ok_or_else(|| CoordinatorError::Invalid("Ride not found.".to_string()))?;
        let refused = || CoordinatorError::Refused("Only completed rides can be rated.".to_string());
        if ride.status != RideStatus::Completed {
            return Err(refused());
        }
        let rated = self
            .services
            .rides
            .rate_ride(ride_id, stars, feedback.trim())
            .await?
            .ok_or_else(refused)?;

        self.completion_dismissed.insert(ride_id);
        self.apply_local(rated.clone());
        self.after_ride_change().await;
        Ok(rated)
    }

    /// Closes the completion screen without rating
    pub async fn dismiss_completion(&mut self) {
        if let Some(ride) = self.latest.as_ref().filter(|r| r.status == RideStatus::Completed) {
            self.completion_dismissed.insert(ride.ride_id);
        }
        self.render().await;
    }

    pub async fn trip_history(&self, limit: i64) -> CoordinatorResult<Vec<RideRecord>> {
        self.ensure_role(Role::Passenger, "see trip history")?;
        Ok(self.services.rides.trip_history(&self.session.user_id, limit).await?)
    }
}
