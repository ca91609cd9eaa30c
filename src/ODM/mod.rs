//!
//! Documentation of the ODM module.
//! Contains all the files needed for the MongoDB database connection:
//! the records and their documents, the conversions between them and the
//! MongoDB backed stores and change feed.
//!


use super::config;
pub mod odm;
pub mod models;
pub mod odm_utils;
