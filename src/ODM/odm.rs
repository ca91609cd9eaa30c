//!
//! Documentation of the odm module.
//! Used to connect to the sakay database. `MongoBackend` implements every
//! store of `services` on top of it, and the change feed on MongoDB change
//! streams (the server must run as a replica set for those).
//!
//! Collections: `rides`, `declined_rides`, `drivers`, `users`, `messages`,
//! `emergencies`, `sessions` and `counters` (id allocation).
//!

use super::*;
use models::*;
use odm_utils::*;
use config::config::ConfyConfig;
use std::time::Duration;

use chrono::Utc;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Collection, Database};

// The async ODM for the MongoDB database connection and queries

use futures::stream::TryStreamExt;
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::change_stream::ChangeStream;
use mongodb::options::{
    ChangeStreamOptions, FindOneAndUpdateOptions, FindOneOptions, FindOptions, FullDocumentType,
    ReturnDocument, UpdateOptions,
};

use mongodb::options::ClientOptions;
use mongodb::Client;
use mongodb::options::ListDatabasesOptions;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::services::*;

/// Buffered notifications per change stream before the forwarder waits
const FEED_BUFFER: usize = 32;

///
/// Initiate DB connection
///
///
/// # Arguments
///
/// * `config` - A config object containing 'database' and 'database_ip'
///
///
/// # Log
///
/// * `info` - "Database Connected!", indicating success
/// * `error` - "Could not connect to MongoDB {error}", indicating error
///
pub async fn init(config: &ConfyConfig) -> mongodb::error::Result<Database> {
    let db = connect(config).await?;
    sync_counter(&db, "rides", "ride_id").await?;
    sync_counter(&db, "emergencies", "emergency_id").await?;
    Ok(db)
}

/// basic connection, isn't available out of the "odm.rs" module
async fn connect(config: &ConfyConfig) -> mongodb::error::Result<Database> {
    let mut client_options = ClientOptions::parse(&config.database_ip).await?;
    client_options.connect_timeout = Some(Duration::from_secs(config.timeout));
    client_options.heartbeat_freq = Some(Duration::from_secs(config.timeout));
    client_options.server_selection_timeout = Some(Duration::from_secs(config.timeout));
    let client = Client::with_options(client_options)?;

    match client.list_database_names(Document::new(), ListDatabasesOptions::builder().build()).await {
        Ok(_) => {
            info!("Database Connected!");
        }
        Err(value) => {
            error!("Could not connect to MongoDB {}", value);
            return Err(value);
        }
    }

    Ok(client.database(&config.database[..]))
}

fn after_update() -> Option<FindOneAndUpdateOptions> {
    Some(
        FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build(),
    )
}

fn active_statuses() -> Vec<&'static str> {
    vec![
        RideStatus::Pending.as_str(),
        RideStatus::Accepted.as_str(),
        RideStatus::OnTrip.as_str(),
    ]
}

/// Every store and the change feed, over one database handle
#[derive(Clone, Debug)]
pub struct MongoBackend {
    db: Database,
}

impl MongoBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn rides(&self) -> Collection<RideDocument> {
        self.db.collection::<RideDocument>("rides")
    }

    fn drivers(&self) -> Collection<DriverDocument> {
        self.db.collection::<DriverDocument>("drivers")
    }

    fn users(&self) -> Collection<UserProfile> {
        self.db.collection::<UserProfile>("users")
    }

    /// Collects a ride cursor into records
    async fn find_rides(&self, filter: Document, options: FindOptions) -> ServiceResult<Vec<RideRecord>> {
        let mut cursor = self.rides().find(filter, options).await?;
        let mut rides = vec![];
        while let Some(result) = cursor.try_next().await? {
            rides.push(doc_to_ride(&result));
        }
        Ok(rides)
    }

    async fn find_one_ride(&self, filter: Document, newest_first: bool) -> ServiceResult<Option<RideRecord>> {
        let options = if newest_first {
            FindOneOptions::builder().sort(doc! { "requested_at": -1, "ride_id": -1 }).build()
        } else {
            FindOneOptions::builder().build()
        };
        let ride = self.rides().find_one(filter, options).await?;
        Ok(ride.as_ref().map(doc_to_ride))
    }

    /// Applies `update` when the ride still matches `filter`
    async fn transition(&self, filter: Document, mut update: Document) -> ServiceResult<Option<RideRecord>> {
        update.insert("updated_at", now());
        let ride = self
            .rides()
            .find_one_and_update(filter, doc! { "$set": update }, after_update())
            .await?;
        Ok(ride.as_ref().map(doc_to_ride))
    }
}

//
// SESSIONS
//

#[rocket::async_trait]
impl AuthProvider for MongoBackend {
    /// The session behind a token, with the profile fields the UI shows
    async fn current_session(&self, token: &str) -> ServiceResult<Option<Session>> {
        let sessions = self.db.collection::<SessionDocument>("sessions");
        let stored = match sessions.find_one(doc! { "token": token }, None).await? {
            Some(value) => value,
            None => return Ok(None),
        };
        if stored.expires_at.to_chrono() <= Utc::now() {
            debug!("Session of {} expired", stored.user_id);
            return Ok(None);
        }

        let profile = self.profile(&stored.user_id).await?;
        let display_name = profile
            .as_ref()
            .map(|p| p.fullname.clone())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| stored.email.clone());

        Ok(Some(Session {
            token: stored.token,
            user_id: stored.user_id,
            role: stored.role,
            email: stored.email,
            display_name,
            avatar_url: profile.as_ref().and_then(|p| p.avatar_url.clone()),
            phone: profile.as_ref().and_then(|p| p.phone.clone()),
            preferred_color: profile.and_then(|p| p.preferred_color),
        }))
    }

    async fn sign_out(&self, token: &str) -> ServiceResult<()> {
        let sessions = self.db.collection::<Document>("sessions");
        sessions.delete_one(doc! { "token": token }, None).await?;
        Ok(())
    }
}

//
// RIDE ACTIONS
//

#[rocket::async_trait]
impl RideStore for MongoBackend {
    async fn insert_ride(&self, ride: NewRide) -> ServiceResult<RideRecord> {
        let collection = self.rides();
        let ride_id = next_id(&self.db, "rides").await?;
        let at = now();
        let document = RideDocument {
            ride_id,
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
        collection.insert_one(&document, None).await?;
        Ok(doc_to_ride(&document))
    }

    async fn ride(&self, ride_id: i64) -> ServiceResult<Option<RideRecord>> {
        self.find_one_ride(doc! { "ride_id": ride_id }, false).await
    }

    /// The active ride when there is one, else the most recently requested
    async fn latest_ride(&self, scope: &RideScope) -> ServiceResult<Option<RideRecord>> {
        match self.active_ride(scope).await? {
            Some(ride) => Ok(Some(ride)),
            None => self.find_one_ride(scope_filter(scope), true).await,
        }
    }

    async fn active_ride(&self, scope: &RideScope) -> ServiceResult<Option<RideRecord>> {
        let mut filter = scope_filter(scope);
        filter.insert("status", doc! { "$in": active_statuses() });
        self.find_one_ride(filter, true).await
    }

    async fn cancel_ride(&self, ride_id: i64) -> ServiceResult<Option<RideRecord>> {
        self.transition(
            doc! { "ride_id": ride_id, "status": RideStatus::Pending.as_str(), "driver_id": Bson::Null },
            doc! { "status": RideStatus::Cancelled.as_str() },
        )
        .await
    }

    async fn cancel_pending_for_passenger(&self, passenger_id: &str) -> ServiceResult<u64> {
        let result = self
            .rides()
            .update_many(
                doc! { "passenger_id": passenger_id, "status": RideStatus::Pending.as_str() },
                doc! { "$set": { "status": RideStatus::Cancelled.as_str(), "updated_at": now() } },
                None,
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn accept_ride(&self, ride_id: i64, driver_id: &str) -> ServiceResult<Option<RideRecord>> {
        self.transition(
            doc! { "ride_id": ride_id, "status": RideStatus::Pending.as_str(), "driver_id": Bson::Null },
            doc! { "status": RideStatus::Accepted.as_str(), "driver_id": driver_id },
        )
        .await
    }

    async fn start_trip(&self, ride_id: i64, driver_id: &str) -> ServiceResult<Option<RideRecord>> {
        self.transition(
            doc! { "ride_id": ride_id, "driver_id": driver_id, "status": RideStatus::Accepted.as_str() },
            doc! { "status": RideStatus::OnTrip.as_str() },
        )
        .await
    }

    async fn complete_ride(&self, ride_id: i64, driver_id: &str, price: f64) -> ServiceResult<Option<RideRecord>> {
        self.transition(
            doc! {
                "ride_id": ride_id,
                "driver_id": driver_id,
                "status": { "$in": [RideStatus::Accepted.as_str(), RideStatus::OnTrip.as_str()] },
            },
            doc! { "status": RideStatus::Completed.as_str(), "price": price },
        )
        .await
    }

    async fn rate_ride(&self, ride_id: i64, rating: u8, feedback: &str) -> ServiceResult<Option<RideRecord>> {
        let review = if feedback.is_empty() { Bson::Null } else { Bson::String(feedback.to_string()) };
        self.transition(
            doc! { "ride_id": ride_id, "status": RideStatus::Completed.as_str() },
            doc! { "rating": rating as i32, "review_text": review },
        )
        .await
    }

    async fn pending_rides(&self) -> ServiceResult<Vec<RideRecord>> {
        let options = FindOptions::builder().sort(doc! { "ride_id": -1 }).build();
        self.find_rides(
            doc! { "status": RideStatus::Pending.as_str(), "driver_id": Bson::Null },
            options,
        )
        .await
    }

    async fn newest_pending_id(&self) -> ServiceResult<Option<i64>> {
        let options = FindOneOptions::builder().sort(doc! { "ride_id": -1 }).build();
        let newest = self
            .rides()
            .find_one(doc! { "status": RideStatus::Pending.as_str() }, options)
            .await?;
        Ok(newest.map(|ride| ride.ride_id))
    }

    async fn declined_ride_ids(&self, driver_id: &str) -> ServiceResult<Vec<i64>> {
        let collection = self.db.collection::<Document>("declined_rides");
        let mut cursor = collection.find(doc! { "driver_id": driver_id }, None).await?;
        let mut declined = vec![];
        while let Some(result) = cursor.try_next().await? {
            if let Ok(ride_id) = result.get_i64("ride_id") {
                declined.push(ride_id);
            }
        }
        Ok(declined)
    }

    async fn decline_ride(&self, driver_id: &str, ride_id: i64) -> ServiceResult<()> {
        let collection = self.db.collection::<Document>("declined_rides");
        let options = UpdateOptions::builder().upsert(true).build();
        collection
            .update_one(
                doc! { "driver_id": driver_id, "ride_id": ride_id },
                doc! { "$setOnInsert": { "declined_at": now() } },
                options,
            )
            .await?;
        Ok(())
    }

    async fn trip_history(&self, passenger_id: &str, limit: i64) -> ServiceResult<Vec<RideRecord>> {
        let options = FindOptions::builder()
            .sort(doc! { "requested_at": -1 })
            .limit(limit.max(0))
            .build();
        self.find_rides(doc! { "passenger_id": passenger_id }, options).await
    }

    async fn completed_by_driver_since(
        &self,
        driver_id: &str,
        since: chrono::DateTime<Utc>,
    ) -> ServiceResult<Vec<RideRecord>> {
        let filter = doc! {
            "driver_id": driver_id,
            "status": RideStatus::Completed.as_str(),
            "updated_at": { "$gte": bson::DateTime::from_chrono(since) },
        };
        self.find_rides(filter, FindOptions::builder().build()).await
    }
}

//
// DRIVER ACTIONS
//

#[rocket::async_trait]
impl DriverStore for MongoBackend {
    async fn driver(&self, driver_id: &str) -> ServiceResult<Option<DriverRecord>> {
        let driver = self.drivers().find_one(doc! { "driver_id": driver_id }, None).await?;
        Ok(driver.as_ref().map(doc_to_driver))
    }

    async fn set_status(&self, driver_id: &str, status: DriverStatus, at: chrono::DateTime<Utc>) -> ServiceResult<()> {
        let result = self
            .drivers()
            .update_one(
                doc! { "driver_id": driver_id },
                doc! { "$set": {
                    "status": driver_status_name(status),
                    "last_status_change": bson::DateTime::from_chrono(at),
                } },
                None,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(ServiceError::NotFound(format!("driver {}", driver_id)));
        }
        Ok(())
    }

    async fn publish_location(
        &self,
        driver_id: &str,
        coords: Coordinates,
        accuracy: f64,
        at: chrono::DateTime<Utc>,
    ) -> ServiceResult<()> {
        self.drivers()
            .update_one(
                doc! { "driver_id": driver_id },
                doc! { "$set": {
                    "current_lat": coords.lat,
                    "current_lng": coords.lng,
                    "location_accuracy": accuracy,
                    "last_location_update": bson::DateTime::from_chrono(at),
                } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn available_drivers(&self) -> ServiceResult<Vec<DriverRecord>> {
        let filter = doc! { "status": "online", "verification_status": "verified" };
        let mut cursor = self.drivers().find(filter, None).await?;
        let mut drivers = vec![];
        while let Some(result) = cursor.try_next().await? {
            drivers.push(doc_to_driver(&result));
        }
        Ok(drivers)
    }
}

//
// USER ACTIONS
//

#[rocket::async_trait]
impl UserStore for MongoBackend {
    async fn profile(&self, user_id: &str) -> ServiceResult<Option<UserProfile>> {
        Ok(self.users().find_one(doc! { "user_id": user_id }, None).await?)
    }

    /// Creates the profile on first save. A missing avatar keeps the stored one.
    async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> ServiceResult<()> {
        let mut fields = doc! {
            "fullname": update.fullname,
            "phone": update.phone,
            "preferred_color": update.preferred_color,
        };
        if let Some(avatar_url) = update.avatar_url {
            fields.insert("avatar_url", avatar_url);
        }
        let options = UpdateOptions::builder().upsert(true).build();
        self.users()
            .update_one(doc! { "user_id": user_id }, doc! { "$set": fields }, options)
            .await?;
        Ok(())
    }
}

//
// CHAT AND EMERGENCIES
//

#[rocket::async_trait]
impl MessageStore for MongoBackend {
    async fn send_message(&self, ride_id: i64, sender_id: &str, content: &str) -> ServiceResult<ChatMessage> {
        let document = MessageDocument {
            ride_id,
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: now(),
        };
        self.db
            .collection::<MessageDocument>("messages")
            .insert_one(&document, None)
            .await?;
        Ok(doc_to_message(&document))
    }

    async fn messages(&self, ride_id: i64) -> ServiceResult<Vec<ChatMessage>> {
        let options = FindOptions::builder().sort(doc! { "created_at": 1 }).build();
        let mut cursor = self
            .db
            .collection::<MessageDocument>("messages")
            .find(doc! { "ride_id": ride_id }, options)
            .await?;
        let mut messages = vec![];
        while let Some(result) = cursor.try_next().await? {
            messages.push(doc_to_message(&result));
        }
        Ok(messages)
    }
}

#[rocket::async_trait]
impl EmergencyStore for MongoBackend {
    async fn create_emergency(&self, emergency: NewEmergency) -> ServiceResult<Emergency> {
        let collection = self.db.collection::<EmergencyDocument>("emergencies");
        let emergency_id = next_id(&self.db, "emergencies").await?;
        let kind = match emergency.ride_id {
            Some(_) => "Passenger SOS",
            None => "General SOS",
        };
        let document = EmergencyDocument {
            emergency_id,
            user_id: emergency.user_id,
            ride_id: emergency.ride_id,
            kind: kind.to_string(),
            status: "active".to_string(),
            location_lat: emergency.location.lat,
            location_lng: emergency.location.lng,
            created_at: now(),
        };
        collection.insert_one(&document, None).await?;
        Ok(doc_to_emergency(&document))
    }
}

//
// CHANGE FEED
//

fn watch_options() -> Option<ChangeStreamOptions> {
    Some(
        ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build(),
    )
}

/// Forwards the full documents of a change stream until either side goes away
fn forward<T, U>(mut stream: ChangeStream<ChangeStreamEvent<T>>, convert: fn(&T) -> U) -> Notifications<U>
where
    T: DeserializeOwned + Unpin + Send + Sync + 'static,
    U: Send + 'static,
{
    let (sender, receiver) = mpsc::channel(FEED_BUFFER);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sender.closed() => break,
                next = stream.try_next() => match next {
                    Ok(Some(event)) => {
                        if let Some(document) = event.full_document {
                            if sender.send(convert(&document)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Change stream closed: {}", e);
                        break;
                    }
                },
            }
        }
        debug!("Change stream forwarder done");
    });
    receiver
}

#[rocket::async_trait]
impl ChangeFeed for MongoBackend {
    async fn ride_notifications(&self, scope: &RideScope) -> ServiceResult<Notifications<RideRecord>> {
        let (field, id) = match scope {
            RideScope::Passenger(id) => ("fullDocument.passenger_id", id.as_str()),
            RideScope::Driver(id) => ("fullDocument.driver_id", id.as_str()),
        };
        let pipeline = vec![doc! { "$match": {
            "operationType": { "$in": ["insert", "update", "replace"] },
            field: id,
        } }];
        let stream = self.rides().watch(pipeline, watch_options()).await?;
        Ok(forward(stream, doc_to_ride))
    }

    async fn pending_ride_inserts(&self) -> ServiceResult<Notifications<RideRecord>> {
        let pipeline = vec![doc! { "$match": {
            "operationType": "insert",
            "fullDocument.status": RideStatus::Pending.as_str(),
        } }];
        let stream = self.rides().watch(pipeline, watch_options()).await?;
        Ok(forward(stream, doc_to_ride))
    }

    async fn driver_updates(&self, driver_id: &str) -> ServiceResult<Notifications<DriverRecord>> {
        let pipeline = vec![doc! { "$match": {
            "operationType": { "$in": ["update", "replace"] },
            "fullDocument.driver_id": driver_id,
        } }];
        let stream = self.drivers().watch(pipeline, watch_options()).await?;
        Ok(forward(stream, doc_to_driver))
    }
}
