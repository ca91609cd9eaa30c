//! Web-mercator viewport math, the same projection the browser map uses

use std::f64::consts::PI;

use serde::Serialize;

use crate::ODM::models::Coordinates;

const TILE_SIZE: f64 = 256.0;
const MAX_LATITUDE: f64 = 85.051_128_78;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    pub center: Coordinates,
    pub zoom: f64,
    pub width_px: f64,
    pub height_px: f64,
}

/// South-west and north-east corners
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub south_west: Coordinates,
    pub north_east: Coordinates,
}

impl Bounds {
    /// Grows each side by `ratio` of the span, like Leaflet's `pad`
    pub fn pad(&self, ratio: f64) -> Bounds {
        let dlat = (self.north_east.lat - self.south_west.lat).abs() * ratio;
        let dlng = (self.north_east.lng - self.south_west.lng).abs() * ratio;
        Bounds {
            south_west: Coordinates::new(self.south_west.lat - dlat, self.south_west.lng - dlng),
            north_east: Coordinates::new(self.north_east.lat + dlat, self.north_east.lng + dlng),
        }
    }
}

fn world_size(zoom: f64) -> f64 {
    TILE_SIZE * 2f64.powf(zoom)
}

/// Pixel position at `zoom`, origin top-left of the world
fn project(at: Coordinates, zoom: f64) -> (f64, f64) {
    let size = world_size(zoom);
    let lat = at.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = (at.lng + 180.0) / 360.0 * size;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * size;
    (x, y)
}

fn unproject(x: f64, y: f64, zoom: f64) -> Coordinates {
    let size = world_size(zoom);
    let lng = x / size * 360.0 - 180.0;
    let n = PI - 2.0 * PI * y / size;
    let lat = n.sinh().atan().to_degrees();
    Coordinates::new(lat, lng)
}

impl Viewport {
    pub fn new(center: Coordinates, zoom: f64) -> Self {
        Self {
            center,
            zoom,
            width_px: 800.0,
            height_px: 600.0,
        }
    }

    pub fn bounds(&self) -> Bounds {
        let (cx, cy) = project(self.center, self.zoom);
        let (hw, hh) = (self.width_px / 2.0, self.height_px / 2.0);
        Bounds {
            south_west: unproject(cx - hw, cy + hh, self.zoom),
            north_east: unproject(cx + hw, cy - hh, self.zoom),
        }
    }

    pub fn contains(&self, at: Coordinates) -> bool {
        let (cx, cy) = project(self.center, self.zoom);
        let (x, y) = project(at, self.zoom);
        (x - cx).abs() <= self.width_px / 2.0 && (y - cy).abs() <= self.height_px / 2.0
    }

    /// Centers on `bounds` at the highest zoom that shows all of it, capped at `max_zoom`
    pub fn fit(&mut self, bounds: Bounds, max_zoom: f64) {
        let (x1, y1) = project(bounds.south_west, 0.0);
        let (x2, y2) = project(bounds.north_east, 0.0);
        let (dx, dy) = ((x2 - x1).abs(), (y2 - y1).abs());

        let zoom_x = if dx > 0.0 { (self.width_px / dx).log2() } else { max_zoom };
        let zoom_y = if dy > 0.0 { (self.height_px / dy).log2() } else { max_zoom };
        let zoom = zoom_x.min(zoom_y).floor().clamp(0.0, max_zoom);

        self.center = unproject((x1 + x2) / 2.0, (y1 + y2) / 2.0, 0.0);
        self.zoom = zoom;
    }
}
