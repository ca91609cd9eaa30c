use super::*;

use rocket::http::ContentType;
use rocket::Data;
use rocket_multipart_form_data::{mime, MultipartFormData, MultipartFormDataField, MultipartFormDataOptions};

use coordinator::{ActiveRideView, RideRequest, View};
use session::SessionRegistry;
use ODM::models::*;

use log::{error, info, warn};

/// Avatars above this size are refused
const AVATAR_LIMIT: u64 = 5 * 1024 * 1024;

#[derive(Deserialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct SignIn {
    pub token: String,
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct CancelledBody {
    pub cancelled: u64,
}

///
///Signs in with a token issued by the auth service
///
///INPUT:  the token, DB access
///OUTPUT: the session, 401 when the token is unknown or expired
///
#[post("/session", data = "<body>")]
async fn sign_in(body: Json<SignIn>, cookies: &CookieJar<'_>, registry: &State<SessionRegistry>) -> ApiResult<Session> {
    match registry.services().auth.current_session(&body.token).await {
        Ok(Some(session)) => {
            sign_in_cookie(cookies, &session.token);
            info!("Server>>Client:\t{} signed in as {:?}", &session.user_id, session.role);
            Ok(Json(Session {
                token: String::new(),
                ..session
            }))
        }
        Ok(None) => Err(ApiError::new(Status::Unauthorized, "This sign-in link has expired.")),
        Err(e) => {
            error!("Auth service failed while signing in: {}", e);
            Err(ApiError::new(Status::ServiceUnavailable, "Something went wrong, please try again."))
        }
    }
}

///
///Logout
///
///INPUT:  user's cookies
///OUTPUT: 204, the session's runtime is gone
///
#[post("/logout")]
async fn logout(user: SessionUser, cookies: &CookieJar<'_>, registry: &State<SessionRegistry>) -> Status {
    if let Err(e) = registry.services().auth.sign_out(&user.session.token).await {
        warn!("Could not sign {} out remotely: {}", user.session.user_id, e);
    }
    registry.end(&user.session.token).await;
    cookies.remove_private(TOKEN_COOKIE);
    info!("Server>>Client:\t{} logged out", user.session.user_id);
    Status::NoContent
}

///
///One geolocation reading (or error) from the browser
///
#[post("/location", data = "<report>")]
async fn location(user: SessionUser, report: Json<LocationReport>) -> Status {
    user.runtime.geo.feed(report.into_inner().into_reading());
    Status::NoContent
}

#[post("/views/<name>")]
async fn switch_view(user: SessionUser, name: &str) -> ApiResult<ActiveRideView> {
    let view = View::parse(name).ok_or_else(|| ApiError::new(Status::NotFound, "Unknown view."))?;
    let mut coordinator = user.runtime.coordinator.lock().await;
    coordinator.switch_view(view).await;
    Ok(Json(coordinator.view()))
}

//
// PASSENGER
//

#[post("/rides", data = "<request>")]
async fn request_ride(user: SessionUser, request: Json<RideRequest>) -> ApiResult<RideRecord> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.request_ride(request.into_inner()).await?))
}

#[post("/rides/<id>/cancel")]
async fn cancel_ride(user: SessionUser, id: i64) -> ApiResult<RideRecord> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.cancel_ride(id).await?))
}

///
///Resets every pending request of the passenger
///
#[post("/rides/cancel-pending")]
async fn cancel_pending(user: SessionUser) -> ApiResult<CancelledBody> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    let cancelled = coordinator.cancel_all_pending().await?;
    Ok(Json(CancelledBody { cancelled }))
}

#[post("/rides/<id>/rate", data = "<form>")]
async fn rate_ride(user: SessionUser, id: i64, form: Json<RatingForm>) -> ApiResult<RideRecord> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.rate_ride(id, form.stars, &form.feedback).await?))
}

#[post("/rides/dismiss-completion")]
async fn dismiss_completion(user: SessionUser) -> Json<ActiveRideView> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    coordinator.dismiss_completion().await;
    Json(coordinator.view())
}

//
// DRIVER
//

#[post("/driver/status", data = "<form>")]
async fn driver_status(user: SessionUser, form: Json<StatusForm>) -> ApiResult<ActiveRideView> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    coordinator.toggle_status(form.online).await?;
    Ok(Json(coordinator.view()))
}

#[post("/rides/<id>/accept")]
async fn accept_ride(user: SessionUser, id: i64) -> ApiResult<RideRecord> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.accept_ride(id).await?))
}

#[post("/rides/<id>/decline")]
async fn decline_ride(user: SessionUser, id: i64) -> Result<Status, ApiError> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    coordinator.decline_ride(id).await?;
    Ok(Status::NoContent)
}

#[post("/rides/<id>/start")]
async fn start_trip(user: SessionUser, id: i64) -> ApiResult<RideRecord> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.start_trip(id).await?))
}

#[post("/rides/<id>/complete", data = "<form>")]
async fn complete_ride(user: SessionUser, id: i64, form: Json<FareForm>) -> ApiResult<RideRecord> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.complete_ride(id, form.fare).await?))
}

//
// BOTH ROLES
//

#[post("/rides/<id>/messages", data = "<form>")]
async fn send_message(user: SessionUser, id: i64, form: Json<MessageForm>) -> ApiResult<ChatMessage> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.send_message(id, &form.content).await?))
}

#[post("/sos")]
async fn sos(user: SessionUser) -> ApiResult<Emergency> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.trigger_sos().await?))
}

///
///Profile editor, with an optional avatar picture
///
///INPUT:  user verification, form data
///OUTPUT: the saved profile
///
#[post("/profile", data = "<data>")]
async fn update_profile(user: SessionUser, content_type: &ContentType, data: Data<'_>) -> ApiResult<UserProfile> {
    let options = MultipartFormDataOptions::with_multipart_form_data_fields(vec![
        MultipartFormDataField::raw("avatar")
            .size_limit(AVATAR_LIMIT)
            .content_type(Some(mime::IMAGE_STAR)),
        MultipartFormDataField::text("fullname"),
        MultipartFormDataField::text("phone"),
        MultipartFormDataField::text("preferred_color"),
    ]);

    let form = match MultipartFormData::parse(content_type, data, options).await {
        Ok(value) => value,
        Err(e) => {
            warn!("Unreadable profile form from {}: {:?}", user.session.user_id, e);
            return Err(ApiError::new(Status::UnprocessableEntity, "The form could not be read."));
        }
    };

    let text = |name: &str| {
        form.texts
            .get(name)
            .and_then(|fields| fields.first())
            .map(|field| field.text.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let fullname = text("fullname").unwrap_or_default();
    let phone = text("phone");
    let preferred_color = text("preferred_color");

    // Use the get method to keep the file fields in the form until it is dropped
    let avatar = form.raw.get("avatar").and_then(|fields| fields.first()).map(|field| {
        let extension = field
            .content_type
            .as_ref()
            .map(|mime| mime.subtype().as_str().to_string())
            .unwrap_or_else(|| "png".to_string());
        (extension, field.raw.clone())
    });

    let mut coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.update_profile(&fullname, phone, preferred_color, avatar).await?))
}

pub fn post_routes() -> Vec<Route> {
    routes![
        sign_in, logout, location, switch_view, request_ride, cancel_ride, cancel_pending,
        rate_ride, dismiss_completion, driver_status, accept_ride, decline_ride, start_trip,
        complete_ride, send_message, sos, update_profile
    ]
}
