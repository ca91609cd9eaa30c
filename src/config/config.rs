//!
//! Documentation of the config module.
//! Sets up the 'config' and 'logger'.
//!

extern crate confy;

use serde::{Deserialize, Serialize};
use std::default::Default;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfyConfig {
    pub print_log: bool,
    pub log_file: String,
    pub database: String,
    pub database_ip: String,
    pub timeout: u64,

    /// Seconds between authoritative ride re-queries
    pub ride_poll_secs: u64,
    /// Seconds between pending request polls for online drivers
    pub pending_poll_secs: u64,

    pub best_effort_timeout_ms: u64,
    pub high_confidence_timeout_ms: u64,
    /// meters
    pub high_confidence_accuracy: f64,
    /// Watch samples less accurate than this (meters) are dropped
    pub watch_accuracy_ceiling: f64,
    pub default_lat: f64,
    pub default_lng: f64,

    pub route_refresh_meters: f64,
    pub jitter_meters: f64,
    pub snap_meters: f64,
    pub degenerate_span_km: f64,
    pub fatigue_hours: i64,

    pub geocoder_url: String,
    pub geocoder_city: String,
    pub geocoder_country: String,
    pub router_url: String,
    pub upload_dir: String,
    pub upload_public_url: String,
}

///Config check
impl Default for ConfyConfig {
    fn default() -> Self {
        ConfyConfig {
            print_log: false,
            log_file: "output.log".to_string(),
            database: "sakay".to_string(),
            database_ip: "mongodb://localhost:27017/".to_string(),
            timeout: 2,
            ride_poll_secs: 5,
            pending_poll_secs: 10,
            best_effort_timeout_ms: 5000,
            high_confidence_timeout_ms: 12000,
            high_confidence_accuracy: 30.0,
            watch_accuracy_ceiling: 100.0,
            default_lat: 9.3068,
            default_lng: 123.3033,
            route_refresh_meters: 25.0,
            jitter_meters: 3.0,
            snap_meters: 150.0,
            degenerate_span_km: 500.0,
            fatigue_hours: 4,
            geocoder_url: "https://nominatim.openstreetmap.org".to_string(),
            geocoder_city: "Dumaguete City, Philippines".to_string(),
            geocoder_country: "ph".to_string(),
            router_url: "https://router.project-osrm.org".to_string(),
            upload_dir: "uploads".to_string(),
            upload_public_url: "/uploads".to_string(),
        }
    }
}

/// Initialize config and load
pub async fn init() -> Result<ConfyConfig, confy::ConfyError> {
    let cfg: ConfyConfig = confy::load_path("sakay.toml").unwrap_or_default();
    Ok(cfg)
}

fn format_line(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    out.finish(format_args!(
        "{}[{}][{}] {}",
        chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
        record.target(),
        record.level(),
        message
    ))
}

/// Sets up logger, always to the log file and to stdout when `print_log` is set
pub async fn setup_logger(file: &ConfyConfig) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(format_line)
        .level(log::LevelFilter::Debug)
        // the mongodb driver and hyper are noisy at debug
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("mongodb", log::LevelFilter::Info);

    if file.print_log {
        dispatch = dispatch.chain(std::io::stdout());
    }

    dispatch.chain(fern::log_file(&file.log_file)?).apply()?;
    Ok(())
}
