//!
//! Documentation of the session module.
//! One running coordinator per signed in browser session. Each runtime owns
//! a pump task that feeds bridge and position events into its coordinator,
//! and the registry maps session tokens to runtimes.
//!

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::coordinator::{CoordinatorSettings, RideLifecycleCoordinator, SessionEvent};
use crate::geo_source::GeoPositionSource;
use crate::services::Collaborators;
use crate::ODM::models::Session;

pub struct SessionRuntime {
    pub coordinator: Arc<Mutex<RideLifecycleCoordinator>>,
    pub geo: GeoPositionSource,
    pump: JoinHandle<()>,
    locate: JoinHandle<()>,
}

impl SessionRuntime {
    /// Starts the coordinator, its event pump and the start-up high-confidence fix
    pub async fn start(
        session: Session,
        services: Collaborators,
        settings: CoordinatorSettings,
        watch_ceiling: f64,
    ) -> Self {
        let (events, mut inbox) = mpsc::unbounded_channel();
        let geo = GeoPositionSource::new(watch_ceiling);
        let policy = settings.high_confidence();

        let mut coordinator = RideLifecycleCoordinator::new(session, services, geo.clone(), settings, events.clone());
        coordinator.start().await;
        let coordinator = Arc::new(Mutex::new(coordinator));

        let pump = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                while let Some(event) = inbox.recv().await {
                    coordinator.lock().await.handle(event).await;
                }
            })
        };

        let locate = {
            let geo = geo.clone();
            tokio::spawn(async move {
                let event = match geo.current_position(policy).await.sample() {
                    Some(sample) => SessionEvent::Position(sample),
                    None => SessionEvent::FixUnavailable,
                };
                let _ = events.send(event);
            })
        };

        Self {
            coordinator,
            geo,
            pump,
            locate,
        }
    }

    /// Stops the pump and releases everything the coordinator holds
    pub async fn end(&self) {
        self.locate.abort();
        self.pump.abort();
        self.coordinator.lock().await.shutdown().await;
    }
}

type Slot = Arc<OnceCell<Arc<SessionRuntime>>>;

/// Running sessions by token
pub struct SessionRegistry {
    services: Collaborators,
    settings: CoordinatorSettings,
    watch_ceiling: f64,
    sessions: Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new(services: Collaborators, settings: CoordinatorSettings, watch_ceiling: f64) -> Self {
        Self {
            services,
            settings,
            watch_ceiling,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Collaborators {
        &self.services
    }

    /// The runtime of the session, started on first use. The registry lock is
    /// only held to find the token's slot, never while a runtime starts.
    pub async fn get_or_start(&self, session: &Session) -> Arc<SessionRuntime> {
        let slot = self
            .sessions
            .lock()
            .await
            .entry(session.token.clone())
            .or_default()
            .clone();

        let runtime = slot
            .get_or_init(|| async {
                info!("Starting runtime for {}", session.user_id);
                Arc::new(
                    SessionRuntime::start(
                        session.clone(),
                        self.services.clone(),
                        self.settings.clone(),
                        self.watch_ceiling,
                    )
                    .await,
                )
            })
            .await
            .clone();

        // ended while it was starting
        let registered = match self.sessions.lock().await.get(&session.token) {
            Some(current) => Arc::ptr_eq(current, &slot),
            None => false,
        };
        if !registered {
            debug!("Runtime of {} ended while starting", session.user_id);
            runtime.end().await;
        }
        runtime
    }

    /// Ends the session's runtime, if it is running
    pub async fn end(&self, token: &str) -> bool {
        let slot = self.sessions.lock().await.remove(token);
        match slot.as_ref().and_then(|slot| slot.get()) {
            Some(runtime) => {
                runtime.end().await;
                true
            }
            None => {
                debug!("No runtime to end for this token");
                false
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
