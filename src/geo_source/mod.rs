//!
//! Documentation of the geo_source module.
//! Wraps the device positioning feed: one-shot fixes under a caller chosen
//! policy and continuous watches that keep delivering until stopped.
//!
//! The browser forwards every `navigator.geolocation` reading (or error) to
//! `POST /location`, which lands in [`GeoPositionSource::feed`]. Platform
//! errors never reach the caller: one-shots resolve to [`Fix::Unavailable`]
//! and watches drop them after logging.
//!

#[cfg(test)]
mod tests;

use std::time::Duration;

use chrono::{DateTime, Utc};
use geo::HaversineDistance;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::ODM::models::Coordinates;

/// Readings kept for slow receivers before they start lagging
const FEED_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub coords: Coordinates,
    /// Radius of the 68% confidence circle, meters. Lower is better.
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformError {
    PermissionDenied,
    Timeout,
    PositionUnavailable,
}

pub type DeviceReading = Result<PositionSample, PlatformError>;

/// How long a one-shot fix may wait and what it settles for
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixPolicy {
    /// Wait the whole timeout, keep the most accurate sample
    BestEffort { timeout: Duration },
    /// Resolve on the first sample within `target_accuracy`, else best-seen at the timeout
    HighConfidence { target_accuracy: f64, timeout: Duration },
}

impl FixPolicy {
    fn timeout(&self) -> Duration {
        match self {
            FixPolicy::BestEffort { timeout } => *timeout,
            FixPolicy::HighConfidence { timeout, .. } => *timeout,
        }
    }

    fn accepts_early(&self, sample: &PositionSample) -> bool {
        match self {
            FixPolicy::BestEffort { .. } => false,
            FixPolicy::HighConfidence { target_accuracy, .. } => sample.accuracy <= *target_accuracy,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fix {
    Position(PositionSample),
    Unavailable,
}

impl Fix {
    pub fn sample(self) -> Option<PositionSample> {
        match self {
            Fix::Position(sample) => Some(sample),
            Fix::Unavailable => None,
        }
    }
}

/// A running watch. Stopping is idempotent and dropping the handle stops it.
#[derive(Debug)]
pub struct WatchHandle {
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Position watch stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub struct GeoPositionSource {
    feed: broadcast::Sender<DeviceReading>,
    watch_ceiling: f64,
}

impl GeoPositionSource {
    pub fn new(watch_ceiling: f64) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self { feed, watch_ceiling }
    }

    /// Hands one device reading to every pending fix and watch
    pub fn feed(&self, reading: DeviceReading) {
        if let Err(error) = &reading {
            debug!("Device reported a positioning error: {:?}", error);
        }
        // no receivers simply means nobody is listening right now
        let _ = self.feed.send(reading);
    }

    pub async fn current_position(&self, policy: FixPolicy) -> Fix {
        let mut readings = self.feed.subscribe();
        let deadline = Instant::now() + policy.timeout();
        let mut best: Option<PositionSample> = None;

        loop {
            match timeout_at(deadline, readings.recv()).await {
                Err(_) => break,
                Ok(Ok(Ok(sample))) => {
                    if !sample.coords.is_plausible() {
                        debug!("Ignoring implausible fix {:?}", sample.coords);
                        continue;
                    }
                    if policy.accepts_early(&sample) {
                        return Fix::Position(sample);
                    }
                    if best.as_ref().map(|b| sample.accuracy < b.accuracy).unwrap_or(true) {
                        best = Some(sample);
                    }
                }
                Ok(Ok(Err(error))) => debug!("One-shot fix ignoring platform error {:?}", error),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!("One-shot fix skipped {} readings", skipped);
                }
                Ok(Err(RecvError::Closed)) => break,
            }
        }

        match best {
            Some(sample) => Fix::Position(sample),
            None => Fix::Unavailable,
        }
    }

    /// Delivers every sample within the accuracy ceiling to `sink` until stopped
    pub fn watch<F>(&self, sink: F) -> WatchHandle
    where
        F: Fn(PositionSample) + Send + 'static,
    {
        let mut readings = self.feed.subscribe();
        let ceiling = self.watch_ceiling;

        let task = tokio::spawn(async move {
            loop {
                match readings.recv().await {
                    Ok(Ok(sample)) => {
                        if sample.accuracy > ceiling {
                            debug!("Dropping noisy fix, accuracy {}m", sample.accuracy);
                        } else if !sample.coords.is_plausible() {
                            debug!("Dropping implausible fix {:?}", sample.coords);
                        } else {
                            sink(sample);
                        }
                    }
                    Ok(Err(error)) => warn!("Position watch error: {:?}", error),
                    Err(RecvError::Lagged(skipped)) => debug!("Position watch skipped {} readings", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        WatchHandle { task: Some(task) }
    }

    /// Stops a watch if there is one
    pub fn stop(handle: Option<&mut WatchHandle>) {
        if let Some(handle) = handle {
            handle.stop();
        }
    }
}

/// Great-circle distance in kilometers
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    haversine_m(a, b) / 1000.0
}

/// Great-circle distance in meters
pub fn haversine_m(a: Coordinates, b: Coordinates) -> f64 {
    a.to_point().haversine_distance(&b.to_point())
}
