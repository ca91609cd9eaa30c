//!
//! #  Sakay - pedicab rides for Dumaguete
//!
//! Sakay connects passengers with pedicab drivers. This server runs one
//! ride lifecycle coordinator per signed in browser session, which keeps
//! the passenger and driver views of a ride in step with the database:
//!
//! * Ride requests, acceptance, pickup, completion and rating
//! * Live driver position on the passenger's map
//! * Pending request alerts for online drivers
//! * Trip chat and SOS alerts
//!

#![allow(non_snake_case)]
#[macro_use] extern crate rocket;
extern crate rocket_multipart_form_data;

mod bridge;
mod config;
mod coordinator;
mod geo_source;
mod map_sync;
mod routes;
mod services;
mod session;
mod ODM;

#[cfg(test)] mod testing;

use std::sync::Arc;

use anyhow::Context;
use rocket::fs::{FileServer, Options};
use rocket::{Build, Rocket};
use log::{error, warn};

use config::config::ConfyConfig;
use coordinator::CoordinatorSettings;
use services::nominatim::Nominatim;
use services::osrm::Osrm;
use services::uploads::LocalUploads;
use services::{Collaborators, ServiceResult};
use session::SessionRegistry;
use ODM::odm::MongoBackend;

/// Every collaborator, backed by MongoDB, Nominatim, OSRM and the upload directory
fn collaborators(config: &ConfyConfig, db: mongodb::Database) -> ServiceResult<Collaborators> {
    let backend = Arc::new(MongoBackend::new(db));
    Ok(Collaborators {
        auth: backend.clone(),
        rides: backend.clone(),
        drivers: backend.clone(),
        users: backend.clone(),
        messages: backend.clone(),
        emergencies: backend.clone(),
        feed: backend,
        geocoder: Arc::new(Nominatim::new(&config.geocoder_url, &config.geocoder_city, &config.geocoder_country)?),
        router: Arc::new(Osrm::new(&config.router_url)?),
        objects: Arc::new(LocalUploads::new(&config.upload_dir, &config.upload_public_url)),
    })
}

/// The server, over whatever collaborators it is given
pub fn build(config: &ConfyConfig, services: Collaborators) -> Rocket<Build> {
    let settings = CoordinatorSettings::from(config);
    rocket::build()
        .mount("/", routes::routes())
        .mount(config.upload_public_url.as_str(), FileServer::new(&config.upload_dir, Options::Missing))
        .manage(SessionRegistry::new(services, settings, config.watch_accuracy_ceiling))
}

/// The main functions, runs w/ cargo run
#[rocket::main]
async fn main() -> anyhow::Result<()> {
    let config = config::config::init().await.context("CONFIG failed to launch")?;
    config::config::setup_logger(&config).await.context("Logger failed to launch")?;
    let db = ODM::odm::init(&config).await.context("Could not connect to MongoDB")?;
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("Could not create {}", config.upload_dir))?;
    let services = collaborators(&config, db)?;
    warn!("SAKAY IS LAUNCHING");

    let lift = build(&config, services).launch().await;

    warn!("SAKAY OVER");
    if let Err(value) = lift {
        error!("Rocket could not run, error {}", value);
    }
    Ok(())
}
