//! Road routing over the OSRM HTTP API

use std::time::Duration;

use log::debug;
use serde::Deserialize;

use super::{Router, RouteSummary, ServiceError, ServiceResult};
use crate::ODM::models::Coordinates;

#[derive(Debug, Deserialize)]
struct RouteResponse {
    code: String,
    #[serde(default)]
    routes: Vec<RouteLeg>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteLeg {
    distance: f64,
    duration: f64,
}

pub struct Osrm {
    http: reqwest::Client,
    base_url: String,
}

impl Osrm {
    pub fn new(base_url: &str) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(8))
            .user_agent("sakay-pedicab/0.1")
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// OSRM wants `lng,lat;lng,lat;...`
fn waypoint_path(waypoints: &[Coordinates]) -> String {
    waypoints
        .iter()
        .map(|c| format!("{},{}", c.lng, c.lat))
        .collect::<Vec<_>>()
        .join(";")
}

#[rocket::async_trait]
impl Router for Osrm {
    async fn route(&self, waypoints: &[Coordinates]) -> ServiceResult<RouteSummary> {
        if waypoints.len() < 2 {
            return Err(ServiceError::NotFound("a route needs two waypoints".to_string()));
        }

        let url = format!(
            "{}/route/v1/driving/{}?overview=false",
            self.base_url,
            waypoint_path(waypoints)
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<RouteResponse>()
            .await?;

        if response.code != "Ok" {
            let reason = response.message.unwrap_or(response.code);
            debug!("OSRM refused the route: {}", reason);
            return Err(ServiceError::NotFound(reason));
        }

        response
            .routes
            .first()
            .map(|leg| RouteSummary {
                distance: leg.distance,
                duration: leg.duration,
            })
            .ok_or_else(|| ServiceError::NotFound("no route between the waypoints".to_string()))
    }
}
