use super::*;

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, status::Custom, Responder};

use crate::geo_source::{DeviceReading, PlatformError, PositionSample};
use coordinator::CoordinatorError;
use session::{SessionRegistry, SessionRuntime};
use ODM::models::*;

/// Name of the private cookie carrying the session token
pub const TOKEN_COOKIE: &str = "token";

// Checking that a user is signed in, and attaching their running session
pub struct SessionUser {
    pub session: Session,
    pub runtime: Arc<SessionRuntime>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SessionUser {
    type Error = String;

    async fn from_request(request: &'r Request<'_>) -> Outcome<SessionUser, String> {
        let registry = match request.guard::<&State<SessionRegistry>>().await {
            Outcome::Success(value) => value,
            _ => return Outcome::Error((Status::InternalServerError, "no session registry".to_string())),
        };
        let token = match request.cookies().get_private(TOKEN_COOKIE) {
            Some(cookie) => cookie.value().to_string(),
            None => return Outcome::Error((Status::Unauthorized, "not signed in".to_string())),
        };

        let session = match registry.services().auth.current_session(&token).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                if registry.end(&token).await {
                    info!("Released the runtime of an expired session");
                }
                request.cookies().remove_private(TOKEN_COOKIE);
                return Outcome::Error((Status::Unauthorized, "session expired".to_string()));
            }
            Err(e) => {
                warn!("Could not resolve a session: {}", e);
                return Outcome::Error((Status::ServiceUnavailable, e.to_string()));
            }
        };

        let route = match request.route() {
            None => "Unknown Route".to_string(),
            Some(value) => format!("{}", value),
        };
        info!(
            "Client>>Server:\t{} is trying to access route: {} as {}",
            &session.user_id,
            route,
            request.method()
        );

        let runtime = registry.get_or_start(&session).await;
        Outcome::Success(SessionUser { session, runtime })
    }
}

/// Sets the session cookie the guard reads
pub fn sign_in_cookie(cookies: &CookieJar<'_>, token: &str) {
    cookies.add_private(Cookie::build((TOKEN_COOKIE, token.to_string())).same_site(SameSite::Lax));
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct ErrorBody {
    pub error: String,
}

/// A failed user action, answered with its status code and a message to show
#[derive(Debug)]
pub struct ApiError {
    pub status: Status,
    pub message: String,
}

impl ApiError {
    pub fn new(status: Status, message: &str) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(error: CoordinatorError) -> Self {
        let status = match &error {
            CoordinatorError::Conflict(_) => Status::Conflict,
            CoordinatorError::Unauthorized(_) => Status::Unauthorized,
            CoordinatorError::Refused(_) => Status::Forbidden,
            CoordinatorError::Invalid(_) => Status::UnprocessableEntity,
            CoordinatorError::Transient(_) => Status::ServiceUnavailable,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        Custom(self.status, Json(ErrorBody { error: self.message })).respond_to(request)
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// One reading from the browser's geolocation API, or the error it reported
#[derive(Deserialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct LocationReport {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub error: Option<PlatformError>,
}

impl LocationReport {
    pub fn into_reading(self) -> DeviceReading {
        if let Some(error) = self.error {
            return Err(error);
        }
        let coords = Coordinates::checked(self.lat, self.lng).ok_or(PlatformError::PositionUnavailable)?;
        let accuracy = self
            .accuracy
            .filter(|a| a.is_finite() && *a >= 0.0)
            .ok_or(PlatformError::PositionUnavailable)?;
        Ok(PositionSample {
            coords,
            accuracy,
            speed: self.speed,
            heading: self.heading,
            taken_at: Utc::now(),
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct RatingForm {
    pub stars: u8,
    #[serde(default)]
    pub feedback: String,
}

#[derive(Deserialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct StatusForm {
    pub online: bool,
}

#[derive(Deserialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct FareForm {
    pub fare: f64,
}

#[derive(Deserialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct MessageForm {
    pub content: String,
}
