//! Driver actions

use chrono::{Local, TimeZone};
use log::info;

use super::*;

pub const NOT_VERIFIED: &str = "Your account is not yet verified. Please wait for TMO approval.";

impl RideLifecycleCoordinator {
    /// Goes online or offline. Only verified drivers may go online.
    pub async fn toggle_status(&mut self, online: bool) -> CoordinatorResult<DriverStatus> {
        self.ensure_role(Role::Driver, "go online")?;
        let record = self
            .services
            .drivers
            .driver(&self.session.user_id)
            .await?
            .ok_or_else(|| CoordinatorError::Refused("No driver profile is registered for this account.".to_string()))?;

        if online && record.verification_status != VerificationStatus::Verified {
            info!("Unverified driver {} tried to go online", self.session.user_id);
            self.driver = Some(record);
            return Err(CoordinatorError::Refused(NOT_VERIFIED.to_string()));
        }

        let status = if online { DriverStatus::Online } else { DriverStatus::Offline };
        let now = Utc::now();
        self.services
            .drivers
            .set_status(&self.session.user_id, status, now)
            .await?;
        info!("Driver {} is now {:?}", self.session.user_id, status);

        self.driver = Some(DriverRecord {
            status,
            last_status_change: Some(now),
            ..record
        });
        if online {
            // an unfinished trip wins over new requests
            self.refresh().await;
        } else {
            self.pending.clear();
            self.sync_subscriptions().await;
            self.render().await;
        }
        Ok(status)
    }

    pub async fn accept_ride(&mut self, ride_id: i64) -> CoordinatorResult<RideRecord> {
        self.ensure_role(Role::Driver, "accept rides")?;
        if !self.driver_online() {
            return Err(CoordinatorError::Refused("Go online to accept rides.".to_string()));
        }
        if let Some(active) = self.services.rides.active_ride(&self.scope()).await? {
            info!("Driver {} is still on ride {}", self.session.user_id, active.ride_id);
            return Err(CoordinatorError::Conflict("Finish your current trip first.".to_string()));
        }

        let accepted = self
            .services
            .rides
            .accept_ride(ride_id, &self.session.user_id)
            .await?
            .ok_or_else(|| CoordinatorError::Conflict("Another driver already took this ride.".to_string()))?;
        info!("Driver {} accepted ride {}", self.session.user_id, ride_id);

        self.pending.clear();
        self.apply_local(accepted.clone());
        self.after_ride_change().await;
        Ok(accepted)
    }

    /// Hides a request from this driver for good
    pub async fn decline_ride(&mut self, ride_id: i64) -> CoordinatorResult<()> {
        self.ensure_role(Role::Driver, "decline rides")?;
        self.services.rides.decline_ride(&self.session.user_id, ride_id).await?;
        self.pending.retain(|r| r.ride_id != ride_id);
        self.map.remove_marker(&format!("request-{}", ride_id));
        self.render().await;
        Ok(())
    }

    /// Marks the passenger as picked up
    pub async fn start_trip(&mut self, ride_id: i64) -> CoordinatorResult<RideRecord> {
        self.ensure_role(Role::Driver, "start trips")?;
        let started = self
            .services
            .rides
            .start_trip(ride_id, &self.session.user_id)
            .await?
            .ok_or_else(|| CoordinatorError::Refused("This ride is not waiting for pickup.".to_string()))?;
        self.apply_local(started.clone());
        self.after_ride_change().await;
        Ok(started)
    }

    /// Finishes the ride with the fare the driver collected
    pub async fn complete_ride(&mut self, ride_id: i64, fare: f64) -> CoordinatorResult<RideRecord> {
        self.ensure_role(Role::Driver, "complete rides")?;
        if !fare.is_finite() || fare <= 0.0 {
            return Err(CoordinatorError::Invalid("Enter a valid amount".to_string()));
        }
        let completed = self
            .services
            .rides
            .complete_ride(ride_id, &self.session.user_id, fare)
            .await?
            .ok_or_else(|| CoordinatorError::Refused("This ride is not in progress.".to_string()))?;
        info!("Driver {} completed ride {} for {:.2}", self.session.user_id, ride_id, fare);

        self.pending.clear();
        self.apply_local(completed.clone());
        self.after_ride_change().await;
        Ok(completed)
    }

    /// Rides completed since local midnight
    pub async fn earnings(&self) -> CoordinatorResult<Earnings> {
        self.ensure_role(Role::Driver, "see earnings")?;
        let today = Local::now().date_naive();
        let since = today
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
            .map(|midnight| midnight.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() - chrono::Duration::days(1));

        let rides = self
            .services
            .rides
            .completed_by_driver_since(&self.session.user_id, since)
            .await?;
        Ok(Earnings {
            count: rides.len(),
            total: rides.iter().map(|r| r.price).sum(),
        })
    }
}
