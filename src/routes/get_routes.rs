use super::*;

use coordinator::{ActiveRideView, Earnings, Notice, PinnedPlace, UiEffect};
use crate::map_sync::Surface;
use crate::services::Suggestion;
use ODM::models::*;

use log::debug;

const HISTORY_LIMIT: i64 = 20;

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct EffectsBody {
    pub effects: Vec<UiEffect>,
    pub notices: Vec<Notice>,
}

///
///The derived ride view of the session
///
#[get("/view")]
async fn view(user: SessionUser) -> Json<ActiveRideView> {
    let coordinator = user.runtime.coordinator.lock().await;
    Json(coordinator.view())
}

///
///Drains the one-shot effects and notices queued since the last call
///
#[get("/effects")]
async fn effects(user: SessionUser) -> Json<EffectsBody> {
    let mut coordinator = user.runtime.coordinator.lock().await;
    Json(EffectsBody {
        effects: coordinator.take_effects(),
        notices: coordinator.take_notices(),
    })
}

///
///Markers, route and viewport of one map surface
///
///INPUT:  surface name ("home" or "full")
///OUTPUT: the surface, 404 while it is not mounted
///
#[get("/map/<surface>")]
async fn map_surface(user: SessionUser, surface: &str) -> Option<Json<Surface>> {
    let coordinator = user.runtime.coordinator.lock().await;
    coordinator.map().snapshot(surface).cloned().map(Json)
}

///
///Chat of the session's current ride, oldest first
///
#[get("/rides/<id>/messages")]
async fn messages(user: SessionUser, id: i64) -> ApiResult<Vec<ChatMessage>> {
    let coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.messages(id).await?))
}

#[get("/driver/earnings")]
async fn earnings(user: SessionUser) -> ApiResult<Earnings> {
    let coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.earnings().await?))
}

///
///Address suggestions near the user
///
#[get("/geo/suggest?<q>")]
async fn suggest(user: SessionUser, q: &str) -> ApiResult<Vec<Suggestion>> {
    if q.trim().chars().count() < 3 {
        debug!("Suggestion query too short");
        return Ok(Json(vec![]));
    }
    let coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.suggest(q).await?))
}

///
///Address of a dropped pin, or of the user's own position
///
///INPUT:  lat and lng together, or neither
///OUTPUT: the spot and its address (null when none is known)
///
#[get("/geo/reverse?<lat>&<lng>")]
async fn reverse(user: SessionUser, lat: Option<f64>, lng: Option<f64>) -> ApiResult<PinnedPlace> {
    let pin = match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
        (None, None) => None,
        _ => return Err(ApiError::new(Status::UnprocessableEntity, "Both lat and lng are needed.")),
    };
    let coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.place_at(pin).await?))
}

#[get("/history?<limit>")]
async fn history(user: SessionUser, limit: Option<i64>) -> ApiResult<Vec<RideRecord>> {
    let coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.trip_history(limit.unwrap_or(HISTORY_LIMIT)).await?))
}

#[get("/drivers/available")]
async fn available_drivers(user: SessionUser) -> ApiResult<Vec<DriverRecord>> {
    let coordinator = user.runtime.coordinator.lock().await;
    Ok(Json(coordinator.available_drivers().await?))
}

///
///The signed in user, with the profile fields the header shows
///
#[get("/me")]
async fn me(user: SessionUser) -> Json<Session> {
    let coordinator = user.runtime.coordinator.lock().await;
    // the token stays in the private cookie
    Json(Session {
        token: String::new(),
        ..coordinator.session().clone()
    })
}

pub fn get_routes() -> Vec<Route> {
    routes![view, effects, map_surface, messages, earnings, suggest, reverse, history, available_drivers, me]
}
