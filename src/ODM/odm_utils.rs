//!
//! Documentation of the Database Utilities module.
//! Conversions between the stored documents and the records the rest of
//! sakay works with, and the error mapping for MongoDB failures.
//!

use super::*;
use models::*;
use bson::{doc, Document};
use bson::DateTime as BsonDateTime;
use mongodb::error::ErrorKind;
use mongodb::options::{FindOneAndUpdateOptions, FindOneOptions, ReturnDocument, UpdateOptions};
use mongodb::{Collection, Database};

/// One `{ _id: <collection>, seq }` document per collection with drawn ids
pub const COUNTERS: &str = "counters";

use crate::services::{RideScope, ServiceError};

/// Converts a RideDocument to RideRecord
pub fn doc_to_ride(document: &RideDocument) -> RideRecord {
    RideRecord {
        ride_id: document.ride_id,
        passenger_id: document.passenger_id.clone(),
        driver_id: document.driver_id.clone(),
        pickup_location: document.pickup_location.clone(),
        dropoff_location: document.dropoff_location.clone(),
        // never hand out a 0,0 or NaN pin
        pickup: document.pickup.filter(|c| c.is_plausible()),
        dropoff: document.dropoff.filter(|c| c.is_plausible()),
        status: document.status,
        price: document.price,
        rating: document.rating.and_then(|r| u8::try_from(r).ok()),
        review_text: document.review_text.clone(),
        requested_at: document.requested_at.to_chrono(),
        updated_at: document.updated_at.to_chrono(),
    }
}

/// Converts a DriverDocument to DriverRecord
pub fn doc_to_driver(document: &DriverDocument) -> DriverRecord {
    DriverRecord {
        driver_id: document.driver_id.clone(),
        status: document.status,
        verification_status: document.verification_status,
        last_status_change: document.last_status_change.map(|d| d.to_chrono()),
        current: Coordinates::checked(document.current_lat, document.current_lng),
        location_accuracy: document.location_accuracy,
        last_location_update: document.last_location_update.map(|d| d.to_chrono()),
        pedicab_plate: document.pedicab_plate.clone(),
        registration_group: document.registration_group.clone(),
    }
}

pub fn doc_to_message(document: &MessageDocument) -> ChatMessage {
    ChatMessage {
        ride_id: document.ride_id,
        sender_id: document.sender_id.clone(),
        content: document.content.clone(),
        created_at: document.created_at.to_chrono(),
    }
}

pub fn doc_to_emergency(document: &EmergencyDocument) -> Emergency {
    Emergency {
        emergency_id: document.emergency_id,
        user_id: document.user_id.clone(),
        ride_id: document.ride_id,
        kind: document.kind.clone(),
        status: document.status.clone(),
        location: Coordinates::new(document.location_lat, document.location_lng),
        created_at: document.created_at.to_chrono(),
    }
}

/// The `status` value of a driver document
pub fn driver_status_name(status: DriverStatus) -> &'static str {
    match status {
        DriverStatus::Online => "online",
        DriverStatus::Offline => "offline",
    }
}

/// Filter matching the rides of a passenger or of a driver
pub fn scope_filter(scope: &RideScope) -> Document {
    match scope {
        RideScope::Passenger(id) => doc! { "passenger_id": id.as_str() },
        RideScope::Driver(id) => doc! { "driver_id": id.as_str() },
    }
}

pub fn now() -> BsonDateTime {
    BsonDateTime::now()
}

/// Reads an integer field of a document, 0 when it is missing
fn int_field(document: Option<&Document>, field: &str) -> i64 {
    document
        .and_then(|document| match document.get(field) {
            Some(bson::Bson::Int64(value)) => Some(*value),
            Some(bson::Bson::Int32(value)) => Some(*value as i64),
            _ => None,
        })
        .unwrap_or(0)
}

/// Get the max value of an integer id field, 0 for an empty collection
pub async fn get_max_id<T>(collection: &Collection<T>, field: &str) -> mongodb::error::Result<i64>
where
    T: serde::de::DeserializeOwned + Unpin + Send + Sync,
{
    let options = FindOneOptions::builder()
        .sort(doc! { field: -1 })
        .projection(doc! { field: 1 })
        .build();
    let top = collection
        .clone_with_type::<Document>()
        .find_one(doc! {}, options)
        .await?;

    Ok(int_field(top.as_ref(), field))
}

/// Raises the `counters` entry of `collection` to its current max id,
/// so ids handed out by `next_id` never collide with stored ones
pub async fn sync_counter(db: &Database, collection: &str, field: &str) -> mongodb::error::Result<()> {
    let max = get_max_id(&db.collection::<Document>(collection), field).await?;
    db.collection::<Document>(COUNTERS)
        .update_one(
            doc! { "_id": collection },
            doc! { "$max": { "seq": max } },
            UpdateOptions::builder().upsert(true).build(),
        )
        .await?;
    Ok(())
}

/// Atomically draws the next id of `collection`
pub async fn next_id(db: &Database, collection: &str) -> mongodb::error::Result<i64> {
    let options = FindOneAndUpdateOptions::builder()
        .upsert(true)
        .return_document(ReturnDocument::After)
        .build();
    let counter = db
        .collection::<Document>(COUNTERS)
        .find_one_and_update(doc! { "_id": collection }, doc! { "$inc": { "seq": 1_i64 } }, options)
        .await?;
    Ok(int_field(counter.as_ref(), "seq"))
}

impl From<mongodb::error::Error> for ServiceError {
    fn from(error: mongodb::error::Error) -> Self {
        match error.kind.as_ref() {
            ErrorKind::Authentication { .. } => ServiceError::Unauthorized(error.to_string()),
            // Unauthorized
            ErrorKind::Command(command) if command.code == 13 => ServiceError::Unauthorized(error.to_string()),
            _ => ServiceError::Unavailable(error.to_string()),
        }
    }
}
