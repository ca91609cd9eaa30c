use super::*;
use crate::testing::FakeRouter;

const HOME: &str = "home";

fn dumaguete() -> Coordinates {
    Coordinates::new(9.3068, 123.3033)
}

fn engine() -> MapSyncEngine {
    let mut map = MapSyncEngine::new(MapConfig::default());
    map.register_surface(HOME, "map-home", dumaguete(), 15.0);
    map
}

fn visual() -> MarkerVisual {
    MarkerVisual::new("You", "self")
}

#[test]
fn upsert_is_idempotent() {
    let mut map = engine();
    let set = SurfaceSet::one(HOME);
    let at = Some(Coordinates::new(9.31, 123.30));

    assert!(map.upsert_marker(&set, "self", MarkerKind::SelfPosition, at, visual()));
    let first: Vec<Coordinates> = map.markers(HOME).iter().map(|m| m.position).collect();
    assert!(map.upsert_marker(&set, "self", MarkerKind::SelfPosition, at, visual()));
    let second: Vec<Coordinates> = map.markers(HOME).iter().map(|m| m.position).collect();

    assert_eq!(first, second);
    assert_eq!(map.markers(HOME).len(), 1);
}

#[test]
fn unusable_positions_are_rejected() {
    let mut map = engine();
    let set = SurfaceSet::All;

    assert!(!map.upsert_marker(&set, "pickup", MarkerKind::Pickup, Some(Coordinates::new(0.0, 0.0)), visual()));
    assert!(!map.upsert_marker(&set, "pickup", MarkerKind::Pickup, None, visual()));
    assert!(!map.upsert_marker(&set, "pickup", MarkerKind::Pickup, Some(Coordinates::new(f64::NAN, 123.3)), visual()));
    assert!(map.markers(HOME).is_empty());
}

#[test]
fn counterpart_moves_are_smoothed() {
    let mut map = engine();
    let set = SurfaceSet::All;
    let start = Coordinates::new(9.3100, 123.3000);
    map.upsert_marker(&set, "driver-7", MarkerKind::Counterpart, Some(start), visual());

    // ~1 m of GPS jitter
    map.upsert_marker(&set, "driver-7", MarkerKind::Counterpart, Some(Coordinates::new(9.31001, 123.3000)), visual());
    assert_eq!(map.markers(HOME)[0].position, start);

    // ~110 m, eased half way
    map.upsert_marker(&set, "driver-7", MarkerKind::Counterpart, Some(Coordinates::new(9.3110, 123.3000)), visual());
    let eased = map.markers(HOME)[0].position;
    assert!((eased.lat - 9.3105).abs() < 1e-9);

    // ~1.1 km, snaps
    let far = Coordinates::new(9.3210, 123.3000);
    map.upsert_marker(&set, "driver-7", MarkerKind::Counterpart, Some(far), visual());
    assert_eq!(map.markers(HOME)[0].position, far);
}

#[test]
fn fit_leaves_a_viewport_alone_when_everything_is_visible() {
    let mut map = engine();
    let set = SurfaceSet::All;
    map.upsert_marker(&set, "self", MarkerKind::SelfPosition, Some(Coordinates::new(9.3070, 123.3035)), visual());
    map.upsert_marker(&set, "pickup", MarkerKind::Pickup, Some(Coordinates::new(9.3065, 123.3030)), visual());

    let before = map.snapshot(HOME).map(|s| s.viewport);
    map.fit_to_markers(&set);
    assert_eq!(map.snapshot(HOME).map(|s| s.viewport), before);
}

#[test]
fn fit_frames_markers_that_left_the_viewport() {
    let mut map = engine();
    let set = SurfaceSet::All;
    let a = Coordinates::new(9.30, 123.30);
    let b = Coordinates::new(9.35, 123.25);
    map.upsert_marker(&set, "self", MarkerKind::SelfPosition, Some(a), visual());
    map.upsert_marker(&set, "destination", MarkerKind::Destination, Some(b), visual());

    map.fit_to_markers(&set);
    let viewport = map.snapshot(HOME).map(|s| s.viewport).expect("surface");
    assert!(viewport.contains(a) && viewport.contains(b));
    assert!(viewport.zoom <= 16.0);
}

#[test]
fn fit_on_a_single_marker_zooms_in() {
    let mut map = engine();
    let set = SurfaceSet::All;
    let far = Coordinates::new(9.40, 123.20);
    map.upsert_marker(&set, "self", MarkerKind::SelfPosition, Some(far), visual());

    map.fit_to_markers(&set);
    let viewport = map.snapshot(HOME).map(|s| s.viewport).expect("surface");
    assert_eq!(viewport.center, far);
    assert_eq!(viewport.zoom, 16.0);
}

#[test]
fn fit_across_a_degenerate_span_centers_on_self() {
    let mut map = engine();
    let set = SurfaceSet::All;
    let manila = Coordinates::new(14.5995, 120.9842);
    let me = Coordinates::new(9.3068, 123.3033);
    map.upsert_marker(&set, "destination", MarkerKind::Destination, Some(manila), visual());
    map.upsert_marker(&set, "self", MarkerKind::SelfPosition, Some(me), visual());
    map.fit_to_markers(&set);
    assert_eq!(map.snapshot(HOME).map(|s| s.viewport.center), Some(me));
}

#[test]
fn reregistering_a_viewport_reuses_the_surface() {
    let mut map = engine();
    map.upsert_marker(&SurfaceSet::All, "self", MarkerKind::SelfPosition, Some(dumaguete()), visual());
    let elsewhere = Coordinates::new(9.32, 123.31);

    assert!(map.register_surface("full", "map-home", elsewhere, 14.0));
    assert!(map.snapshot(HOME).is_none());
    let surface = map.snapshot("full").expect("reused surface");
    assert_eq!(surface.viewport.center, elsewhere);
    assert_eq!(surface.markers.len(), 1);
}

#[rocket::async_test]
async fn route_needs_two_usable_waypoints() {
    let mut map = engine();
    let router = FakeRouter::default();
    let set = SurfaceSet::All;
    let a = Some(Coordinates::new(9.30, 123.30));
    let b = Some(Coordinates::new(9.31, 123.31));

    let summary = map.draw_route(&router, &set, &[a, None, b]).await;
    assert_eq!(summary.map(|s| s.distance), Some(1000.0));

    let kept = map.snapshot(HOME).and_then(|s| s.route.clone());
    assert!(map.draw_route(&router, &set, &[a, Some(Coordinates::new(0.0, 0.0))]).await.is_none());
    assert_eq!(map.snapshot(HOME).and_then(|s| s.route.clone()), kept);
    assert_eq!(router.requests(), 1);
}

#[rocket::async_test]
async fn routing_failure_keeps_the_overlay_without_summary() {
    let mut map = engine();
    let router = FakeRouter {
        down: true,
        ..Default::default()
    };
    let set = SurfaceSet::All;
    let waypoints = [Some(Coordinates::new(9.30, 123.30)), Some(Coordinates::new(9.31, 123.31))];

    assert!(map.draw_route(&router, &set, &waypoints).await.is_none());
    let route = map.snapshot(HOME).and_then(|s| s.route.clone()).expect("overlay");
    assert_eq!(route.waypoints.len(), 2);
    assert!(route.summary.is_none());
    assert!(!map.route_is_stale(&set, &waypoints, 25.0));
    assert!(map.route_is_stale(&set, &[waypoints[0], Some(Coordinates::new(9.32, 123.31))], 25.0));
}
