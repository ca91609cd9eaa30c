//!
//! Documentation of the config module.
//! Loads `sakay.toml` and configures the logger.
//!

pub mod config;
