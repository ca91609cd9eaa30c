pub mod get_routes;
pub mod post_routes;
pub mod routes_utils;

use super::coordinator;
use super::session;
use super::ODM;

use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::serde::{json::Json, Deserialize, Serialize};
use rocket::Route;
use rocket::State;

pub use routes_utils::*;

use get_routes::get_routes;
use post_routes::post_routes;

pub fn routes() -> Vec<Route> {
    let mut routes = get_routes();
    routes.append(&mut post_routes());
    routes
}
