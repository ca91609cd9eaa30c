//!
//! Documentation of the bridge module.
//! Turns the change feed and periodic polling of the ride store into one
//! stream of events per subscription. Push notifications are not trusted to
//! arrive, so every ride subscription also re-reads the authoritative ride on
//! an interval and emits a synthetic event whenever the two disagree.
//!
//! Every ride event carries a sequence number drawn when its fetch or
//! notification started. The coordinator uses it to throw away results that
//! were overtaken while in flight.
//!


use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::services::{ChangeFeed, Notifications, RideScope, RideStore};
use crate::ODM::models::{DriverLocation, RideRecord, RideStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Push,
    Poll,
    /// Result of the session's own write or refresh
    Local,
}

/// One observation of "the" ride of a scope. `None` means the store reported no ride.
#[derive(Debug, Clone, PartialEq)]
pub struct RideObservation {
    pub seq: u64,
    pub ride: Option<RideRecord>,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    /// Pending rides the driver has not declined, newest first
    pub rides: Vec<RideRecord>,
    /// The batch holds a request newer than anything seen before
    pub fresh: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    RideChanged(RideObservation),
    DriverMoved(DriverLocation),
    PendingRides(PendingBatch),
}

/// Background tasks behind one subscription, aborted on cancel or drop
#[derive(Debug, Default)]
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn cancel(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

type Fingerprint = Option<(i64, RideStatus, DateTime<Utc>)>;

fn fingerprint(ride: &Option<RideRecord>) -> Fingerprint {
    ride.as_ref().map(|r| (r.ride_id, r.status, r.updated_at))
}

#[derive(Clone)]
pub struct RealtimeChangeBridge {
    rides: Arc<dyn RideStore>,
    feed: Arc<dyn ChangeFeed>,
    seq: Arc<AtomicU64>,
    ride_poll: Duration,
    pending_poll: Duration,
}

impl RealtimeChangeBridge {
    pub fn new(rides: Arc<dyn RideStore>, feed: Arc<dyn ChangeFeed>, ride_poll: Duration, pending_poll: Duration) -> Self {
        Self {
            rides,
            feed,
            seq: Arc::new(AtomicU64::new(0)),
            ride_poll,
            pending_poll,
        }
    }

    /// Draws the next sequence number, shared with the coordinator's own reads
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn subscribe_ride_changes<F>(&self, scope: RideScope, sink: F) -> Subscription
    where
        F: Fn(BridgeEvent) + Send + Sync + 'static,
    {
        let sink = Arc::new(sink);
        let forwarded: Arc<Mutex<Option<Fingerprint>>> = Arc::new(Mutex::new(None));

        let push = {
            let bridge = self.clone();
            let sink = sink.clone();
            let forwarded = forwarded.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                let mut notifications = match bridge.feed.ride_notifications(&scope).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!("Ride notifications unavailable for {:?}, polling only: {}", scope, e);
                        return;
                    }
                };
                while let Some(ride) = notifications.recv().await {
                    let seq = bridge.next_seq();
                    let ride = Some(ride);
                    remember(&forwarded, fingerprint(&ride));
                    sink(BridgeEvent::RideChanged(RideObservation {
                        seq,
                        ride,
                        origin: Origin::Push,
                    }));
                }
                debug!("Ride notifications for {:?} closed", scope);
            })
        };

        let poll = {
            let bridge = self.clone();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + bridge.ride_poll, bridge.ride_poll);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let seq = bridge.next_seq();
                    let ride = match bridge.rides.latest_ride(&scope).await {
                        Ok(ride) => ride,
                        Err(e) => {
                            debug!("Ride poll for {:?} failed: {}", scope, e);
                            continue;
                        }
                    };
                    let current = fingerprint(&ride);
                    let differs = match forwarded.lock() {
                        Ok(last) => *last != Some(current),
                        Err(_) => true,
                    };
                    if differs {
                        debug!("Ride poll for {:?} found a change the feed missed", scope);
                        remember(&forwarded, current);
                        sink(BridgeEvent::RideChanged(RideObservation {
                            seq,
                            ride,
                            origin: Origin::Poll,
                        }));
                    }
                }
            })
        };

        Subscription { tasks: vec![push, poll] }
    }

    /// Push only; the caller reads the initial position itself
    pub fn subscribe_driver_location<F>(&self, driver_id: &str, sink: F) -> Subscription
    where
        F: Fn(BridgeEvent) + Send + Sync + 'static,
    {
        let feed = self.feed.clone();
        let driver_id = driver_id.to_string();
        let task = tokio::spawn(async move {
            let mut updates = match feed.driver_updates(&driver_id).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("Driver updates unavailable for {}: {}", driver_id, e);
                    return;
                }
            };
            while let Some(record) = updates.recv().await {
                match record.location() {
                    Some(location) => sink(BridgeEvent::DriverMoved(location)),
                    None => debug!("Driver {} update without a usable position", driver_id),
                }
            }
        });
        Subscription { tasks: vec![task] }
    }

    /// Announces requests newer than the newest pending ride at subscription time
    pub fn subscribe_new_pending_rides<F>(&self, driver_id: &str, sink: F) -> Subscription
    where
        F: Fn(BridgeEvent) + Send + Sync + 'static,
    {
        let bridge = self.clone();
        let driver_id = driver_id.to_string();

        let task = tokio::spawn(async move {
            let mut watcher = PendingWatcher {
                mark: match bridge.rides.newest_pending_id().await {
                    Ok(newest) => Some(newest.unwrap_or(0)),
                    Err(e) => {
                        warn!("Could not read the newest pending ride: {}", e);
                        None
                    }
                },
                shown: None,
            };
            let mut inserts = match bridge.feed.pending_ride_inserts().await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!("Pending ride inserts unavailable, polling only: {}", e);
                    None
                }
            };

            let mut ticker = interval_at(Instant::now() + bridge.pending_poll, bridge.pending_poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let step = tokio::select! {
                    _ = ticker.tick() => Step::Tick,
                    pushed = next_insert(&mut inserts) => Step::Pushed(pushed),
                };

                match step {
                    Step::Pushed(None) => {
                        debug!("Pending ride inserts closed, polling only");
                        inserts = None;
                        continue;
                    }
                    Step::Pushed(Some(ride)) => {
                        let newer = watcher.mark.map(|mark| ride.ride_id > mark).unwrap_or(true);
                        if ride.status != RideStatus::Pending || !newer {
                            continue;
                        }
                    }
                    Step::Tick => {}
                }

                if let Some(batch) = watcher.refresh(bridge.rides.as_ref(), &driver_id).await {
                    sink(BridgeEvent::PendingRides(batch));
                }
            }
        });

        Subscription { tasks: vec![task] }
    }
}

enum Step {
    Tick,
    Pushed(Option<RideRecord>),
}

fn remember(forwarded: &Mutex<Option<Fingerprint>>, current: Fingerprint) {
    if let Ok(mut last) = forwarded.lock() {
        *last = Some(current);
    }
}

async fn next_insert(inserts: &mut Option<Notifications<RideRecord>>) -> Option<RideRecord> {
    match inserts {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

struct PendingWatcher {
    /// Highest pending ride id seen; `None` until the first successful read
    mark: Option<i64>,
    shown: Option<BTreeSet<i64>>,
}

impl PendingWatcher {
    async fn refresh(&mut self, rides: &dyn RideStore, driver_id: &str) -> Option<PendingBatch> {
        let pending = match rides.pending_rides().await {
            Ok(pending) => pending,
            Err(e) => {
                debug!("Pending ride poll failed: {}", e);
                return None;
            }
        };
        let declined = match rides.declined_ride_ids(driver_id).await {
            Ok(declined) => declined,
            Err(e) => {
                debug!("Declined rides poll failed: {}", e);
                return None;
            }
        };

        let visible: Vec<RideRecord> = pending
            .iter()
            .filter(|r| !declined.contains(&r.ride_id))
            .cloned()
            .collect();
        let newest = pending.iter().map(|r| r.ride_id).max();

        let fresh = match self.mark {
            Some(mark) => visible.iter().any(|r| r.ride_id > mark),
            None => false,
        };
        self.mark = match (self.mark, newest) {
            (Some(mark), Some(newest)) => Some(mark.max(newest)),
            (mark, newest) => mark.or(newest).or(Some(0)),
        };

        let ids: BTreeSet<i64> = visible.iter().map(|r| r.ride_id).collect();
        let changed = self.shown.as_ref() != Some(&ids);
        self.shown = Some(ids);

        if fresh || changed {
            Some(PendingBatch { rides: visible, fresh })
        } else {
            None
        }
    }
}
