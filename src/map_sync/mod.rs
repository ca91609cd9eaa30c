//!
//! Documentation of the map_sync module.
//! Keeps the session's map surfaces (the home map and the full screen map)
//! in step with the coordinator: markers keyed by stable ids, at most one
//! route overlay per surface, and viewport fitting that leaves a user who is
//! panning alone. The browser renders a surface from its snapshot.
//!
//! Bad coordinates stop here: a missing, NaN or (0, 0) position is logged
//! and dropped rather than rendered in the Gulf of Guinea.
//!

pub mod viewport;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use geo::{BoundingRect, MultiPoint, Point};
use log::{debug, warn};
use serde::Serialize;

use crate::geo_source::{haversine_km, haversine_m};
use crate::services::{RouteSummary, Router};
use crate::ODM::models::Coordinates;
pub use viewport::{Bounds, Viewport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerKind {
    SelfPosition,
    Counterpart,
    Pickup,
    Destination,
    PendingRequest,
    Sos,
}

impl MarkerKind {
    /// Lower is more trusted when the markers are too far apart to fit
    fn trust(&self) -> u8 {
        match self {
            MarkerKind::SelfPosition => 0,
            MarkerKind::Counterpart => 1,
            MarkerKind::Pickup => 2,
            MarkerKind::Destination => 3,
            MarkerKind::PendingRequest => 4,
            MarkerKind::Sos => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerVisual {
    pub title: String,
    pub popup: Option<String>,
    pub icon: String,
    /// The user's preferred color, for self markers
    pub accent: Option<String>,
}

impl MarkerVisual {
    pub fn new(title: &str, icon: &str) -> Self {
        Self {
            title: title.to_string(),
            popup: None,
            icon: icon.to_string(),
            accent: None,
        }
    }

    pub fn with_popup(mut self, popup: String) -> Self {
        self.popup = Some(popup);
        self
    }

    pub fn with_accent(mut self, accent: Option<String>) -> Self {
        self.accent = accent;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub id: String,
    pub kind: MarkerKind,
    pub position: Coordinates,
    pub visual: MarkerVisual,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteOverlay {
    pub waypoints: Vec<Coordinates>,
    pub summary: Option<RouteSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Surface {
    pub name: String,
    pub viewport_id: String,
    pub viewport: Viewport,
    pub markers: BTreeMap<String, Marker>,
    pub route: Option<RouteOverlay>,
}

/// Which surfaces a command applies to
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceSet {
    All,
    Only(Vec<String>),
}

impl SurfaceSet {
    pub fn one(name: &str) -> Self {
        SurfaceSet::Only(vec![name.to_string()])
    }

    fn includes(&self, name: &str) -> bool {
        match self {
            SurfaceSet::All => true,
            SurfaceSet::Only(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapConfig {
    /// Counterpart moves shorter than this (m) are ignored
    pub jitter_meters: f64,
    /// Counterpart moves shorter than this (m) are eased, longer ones snap
    pub snap_meters: f64,
    pub ease_factor: f64,
    pub degenerate_span_km: f64,
    pub fit_padding: f64,
    pub max_fit_zoom: f64,
    pub single_marker_zoom: f64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            jitter_meters: 3.0,
            snap_meters: 150.0,
            ease_factor: 0.5,
            degenerate_span_km: 500.0,
            fit_padding: 0.3,
            max_fit_zoom: 16.0,
            single_marker_zoom: 16.0,
        }
    }
}

pub struct MapSyncEngine {
    surfaces: BTreeMap<String, Surface>,
    config: MapConfig,
}

fn ease(from: Coordinates, to: Coordinates, factor: f64) -> Coordinates {
    Coordinates::new(
        from.lat + (to.lat - from.lat) * factor,
        from.lng + (to.lng - from.lng) * factor,
    )
}

impl MapSyncEngine {
    pub fn new(config: MapConfig) -> Self {
        Self {
            surfaces: BTreeMap::new(),
            config,
        }
    }

    /// Registers a surface, or re-centers and reuses the one already bound
    /// to `viewport_id`. Returns true when an existing surface was reused.
    pub fn register_surface(&mut self, name: &str, viewport_id: &str, center: Coordinates, zoom: f64) -> bool {
        let existing = self
            .surfaces
            .values()
            .find(|s| s.viewport_id == viewport_id)
            .map(|s| s.name.clone());

        if let Some(previous) = existing {
            if let Some(mut surface) = self.surfaces.remove(&previous) {
                debug!("Reusing map surface {} for {}", previous, name);
                surface.name = name.to_string();
                surface.viewport.center = center;
                surface.viewport.zoom = zoom;
                self.surfaces.insert(name.to_string(), surface);
            }
            return true;
        }

        self.surfaces.insert(
            name.to_string(),
            Surface {
                name: name.to_string(),
                viewport_id: viewport_id.to_string(),
                viewport: Viewport::new(center, zoom),
                markers: BTreeMap::new(),
                route: None,
            },
        );
        false
    }

    pub fn destroy_surface(&mut self, name: &str) {
        if self.surfaces.remove(name).is_some() {
            debug!("Destroyed map surface {}", name);
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<&Surface> {
        self.surfaces.get(name)
    }

    pub fn surface_names(&self) -> Vec<String> {
        self.surfaces.keys().cloned().collect()
    }

    fn targets<'a>(&'a mut self, set: &'a SurfaceSet) -> impl Iterator<Item = &'a mut Surface> + 'a {
        self.surfaces.values_mut().filter(move |s| set.includes(&s.name))
    }

    /// Creates or moves a marker on every surface of the set. Returns false
    /// when the position was rejected.
    pub fn upsert_marker(
        &mut self,
        set: &SurfaceSet,
        id: &str,
        kind: MarkerKind,
        position: Option<Coordinates>,
        visual: MarkerVisual,
    ) -> bool {
        let position = match position.filter(|p| p.is_plausible()) {
            Some(position) => position,
            None => {
                warn!("Dropping marker {} with unusable position {:?}", id, position);
                return false;
            }
        };
        let config = self.config.clone();
        let now = Utc::now();

        for surface in self.targets(set) {
            match surface.markers.get_mut(id) {
                Some(marker) => {
                    let moved = if kind == MarkerKind::Counterpart {
                        let distance = haversine_m(marker.position, position);
                        if distance < config.jitter_meters {
                            marker.position
                        } else if distance < config.snap_meters {
                            ease(marker.position, position, config.ease_factor)
                        } else {
                            position
                        }
                    } else {
                        position
                    };
                    marker.position = moved;
                    marker.kind = kind;
                    marker.visual = visual.clone();
                    marker.updated_at = now;
                }
                None => {
                    surface.markers.insert(
                        id.to_string(),
                        Marker {
                            id: id.to_string(),
                            kind,
                            position,
                            visual: visual.clone(),
                            updated_at: now,
                        },
                    );
                }
            }
        }
        true
    }

    pub fn remove_marker(&mut self, id: &str) {
        for surface in self.surfaces.values_mut() {
            surface.markers.remove(id);
        }
    }

    /// Keeps only the markers for which `keep` holds
    pub fn retain_markers<F>(&mut self, set: &SurfaceSet, keep: F)
    where
        F: Fn(&Marker) -> bool,
    {
        for surface in self.targets(set) {
            surface.markers.retain(|_, marker| keep(marker));
        }
    }

    pub fn clear_route(&mut self, set: &SurfaceSet) {
        for surface in self.targets(set) {
            surface.route = None;
        }
    }

    pub fn clear_all(&mut self) {
        for surface in self.surfaces.values_mut() {
            surface.markers.clear();
            surface.route = None;
        }
    }

    pub fn markers(&self, name: &str) -> Vec<&Marker> {
        self.surfaces
            .get(name)
            .map(|s| s.markers.values().collect())
            .unwrap_or_default()
    }

    /// True when no overlay exists or a waypoint moved more than `threshold` meters
    pub fn route_is_stale(&self, set: &SurfaceSet, waypoints: &[Option<Coordinates>], threshold: f64) -> bool {
        let wanted: Vec<Coordinates> = waypoints.iter().flatten().copied().filter(|c| c.is_plausible()).collect();
        self.surfaces
            .values()
            .filter(|s| set.includes(&s.name))
            .any(|surface| match &surface.route {
                None => true,
                Some(route) => {
                    route.waypoints.len() != wanted.len()
                        || route
                            .waypoints
                            .iter()
                            .zip(wanted.iter())
                            .any(|(a, b)| haversine_m(*a, *b) > threshold)
                }
            })
    }

    /// Replaces the route overlay and asks the router for its distance and
    /// duration. Fewer than two usable waypoints leaves the prior route alone.
    pub async fn draw_route(
        &mut self,
        router: &dyn Router,
        set: &SurfaceSet,
        waypoints: &[Option<Coordinates>],
    ) -> Option<RouteSummary> {
        let valid: Vec<Coordinates> = waypoints.iter().flatten().copied().filter(|c| c.is_plausible()).collect();
        if valid.len() < 2 {
            debug!("Not drawing a route through {} usable waypoints", valid.len());
            return None;
        }

        for surface in self.targets(set) {
            surface.route = Some(RouteOverlay {
                waypoints: valid.clone(),
                summary: None,
            });
        }

        match router.route(&valid).await {
            Ok(summary) => {
                for surface in self.targets(set) {
                    if let Some(route) = surface.route.as_mut() {
                        route.summary = Some(summary);
                    }
                }
                Some(summary)
            }
            Err(e) => {
                warn!("Routing failed, keeping the straight overlay: {}", e);
                None
            }
        }
    }

    /// Brings every marker into view on each surface of the set. A surface
    /// that already shows all its markers is left alone.
    pub fn fit_to_markers(&mut self, set: &SurfaceSet) {
        let config = self.config.clone();
        for surface in self.targets(set) {
            let mut markers: Vec<&Marker> = surface.markers.values().collect();
            if markers.is_empty() {
                continue;
            }
            if markers.iter().all(|m| surface.viewport.contains(m.position)) {
                continue;
            }

            if markers.len() == 1 {
                surface.viewport.center = markers[0].position;
                surface.viewport.zoom = config.single_marker_zoom;
                continue;
            }

            markers.sort_by_key(|m| m.kind.trust());
            let points: MultiPoint<f64> = markers.iter().map(|m| Point::from(m.position.to_point())).collect();
            let rect = match points.bounding_rect() {
                Some(rect) => rect,
                None => continue,
            };
            let bounds = Bounds {
                south_west: Coordinates::new(rect.min().y, rect.min().x),
                north_east: Coordinates::new(rect.max().y, rect.max().x),
            };

            if haversine_km(bounds.south_west, bounds.north_east) > config.degenerate_span_km {
                warn!(
                    "Markers on {} span more than {}km, centering on {}",
                    surface.name, config.degenerate_span_km, markers[0].id
                );
                surface.viewport.center = markers[0].position;
                continue;
            }

            let padded = bounds.pad(config.fit_padding);
            surface.viewport.fit(padded, config.max_fit_zoom);
        }
    }
}
