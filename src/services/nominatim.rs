//! Geocoding over the Nominatim HTTP API

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;

use super::{GeocodeHit, Geocoder, ServiceError, ServiceResult, Suggestion};
use crate::geo_source::haversine_km;
use crate::ODM::models::Coordinates;

/// Local names people type that Nominatim does not know
const ALIASES: [(&str, &str); 12] = [
    ("SUMC", "Silliman University Medical Center"),
    ("NORSU", "Negros Oriental State University"),
    ("SILLIMAN", "Silliman University"),
    ("SU", "Silliman University"),
    ("SM", "SM Mall"),
    ("UP", "University of the Philippines"),
    ("MSU", "Mindanao State University"),
    ("UST", "University of Santo Tomas"),
    ("DLSU", "De La Salle University"),
    ("ADMU", "Ateneo de Manila University"),
    ("ROB", "Robinsons Place"),
    ("ROBS", "Robinsons Place"),
];

/// Reverse lookups kept before the cache starts over
const REVERSE_CACHE_LIMIT: usize = 512;

/// Degrees around the user searched first, roughly 50km
const VIEWBOX_DELTA: f64 = 0.5;

#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
    display_name: Option<String>,
    address: Option<AddressParts>,
}

#[derive(Debug, Default, Deserialize)]
struct AddressParts {
    university: Option<String>,
    school: Option<String>,
    college: Option<String>,
    mall: Option<String>,
    amenity: Option<String>,
    building: Option<String>,
    office: Option<String>,
    shop: Option<String>,
    tourism: Option<String>,
    historic: Option<String>,
    hospital: Option<String>,
    road: Option<String>,
    suburb: Option<String>,
    neighbourhood: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
}

impl AddressParts {
    fn place_name(&self) -> Option<&String> {
        self.university
            .as_ref()
            .or(self.school.as_ref())
            .or(self.college.as_ref())
            .or(self.mall.as_ref())
            .or(self.amenity.as_ref())
            .or(self.building.as_ref())
            .or(self.office.as_ref())
            .or(self.shop.as_ref())
            .or(self.tourism.as_ref())
            .or(self.historic.as_ref())
            .or(self.hospital.as_ref())
    }

    fn area(&self) -> Option<&String> {
        self.suburb.as_ref().or(self.neighbourhood.as_ref())
    }

    /// "Place, Road" when a named place exists, else "Road, Area"
    fn label(&self) -> Option<String> {
        if let Some(place) = self.place_name() {
            return Some(match self.road.as_ref().or(self.area()) {
                Some(road) => format!("{}, {}", place, road),
                None => place.clone(),
            });
        }
        let road = self.road.as_ref()?;
        let area = self
            .area()
            .or(self.city.as_ref())
            .or(self.town.as_ref())
            .or(self.village.as_ref());
        Some(match area {
            Some(area) => format!("{}, {}", road, area),
            None => road.clone(),
        })
    }
}

impl Place {
    fn coords(&self) -> Option<Coordinates> {
        Coordinates::checked(self.lat.parse().ok(), self.lon.parse().ok())
    }
}

pub struct Nominatim {
    http: reqwest::Client,
    base_url: String,
    city_suffix: String,
    country_codes: String,
    reverse_cache: Mutex<HashMap<String, String>>,
}

impl Nominatim {
    pub fn new(base_url: &str, city_suffix: &str, country_codes: &str) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent("sakay-pedicab/0.1")
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            city_suffix: city_suffix.to_string(),
            country_codes: country_codes.to_string(),
            reverse_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn search(&self, params: &[(&str, String)]) -> ServiceResult<Vec<Place>> {
        let url = format!("{}/search", self.base_url);
        let places = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Place>>()
            .await?;
        Ok(places)
    }
}

/// Expands a known acronym, either alone or as the first word
pub fn expand_alias(query: &str) -> String {
    let trimmed = query.trim();
    let (head, tail) = match trimmed.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, Some(tail.trim_start())),
        None => (trimmed, None),
    };
    let head = head.to_uppercase();

    match ALIASES.iter().find(|(alias, _)| *alias == head) {
        Some((_, full)) => match tail {
            Some(tail) => format!("{} {}", full, tail),
            None => full.to_string(),
        },
        None => trimmed.to_string(),
    }
}

/// Stores a reverse lookup, starting over once the cache is full
fn remember_label(cache: &mut HashMap<String, String>, key: String, label: String) {
    if cache.len() >= REVERSE_CACHE_LIMIT {
        debug!("Reverse geocoding cache full, clearing {} entries", cache.len());
        cache.clear();
    }
    cache.insert(key, label);
}

fn cache_key(at: Coordinates) -> String {
    format!("{:.5},{:.5}", at.lat, at.lng)
}

#[rocket::async_trait]
impl Geocoder for Nominatim {
    async fn geocode(&self, address: &str) -> ServiceResult<Option<GeocodeHit>> {
        let query = format!("{}, {}", address.trim(), self.city_suffix);
        let places = self
            .search(&[
                ("format", "json".to_string()),
                ("q", query),
                ("limit", "1".to_string()),
            ])
            .await?;

        let hit = places.into_iter().find_map(|place| {
            let coords = place.coords()?;
            Some(GeocodeHit {
                coords,
                display_name: place.display_name.unwrap_or_else(|| address.to_string()),
            })
        });
        if hit.is_none() {
            debug!("No geocoding result for {}", address);
        }
        Ok(hit)
    }

    async fn reverse_geocode(&self, at: Coordinates) -> ServiceResult<Option<String>> {
        let key = cache_key(at);
        if let Ok(cache) = self.reverse_cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(Some(hit.clone()));
            }
        }

        let url = format!("{}/reverse", self.base_url);
        let place = self
            .http
            .get(&url)
            .query(&[
                ("format", "json".to_string()),
                ("lat", at.lat.to_string()),
                ("lon", at.lng.to_string()),
                ("zoom", "18".to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<Place>()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        let label = place
            .address
            .as_ref()
            .and_then(|address| address.label())
            .or(place.display_name);

        if let Some(label) = &label {
            match self.reverse_cache.lock() {
                Ok(mut cache) => remember_label(&mut cache, key, label.clone()),
                Err(_) => warn!("Reverse geocoding cache is poisoned, skipping insert"),
            }
        }
        Ok(label)
    }

    async fn suggest(&self, query: &str, near: Option<Coordinates>) -> ServiceResult<Vec<Suggestion>> {
        if query.trim().is_empty() {
            return Ok(vec![]);
        }

        let mut params = vec![
            ("format", "json".to_string()),
            ("q", expand_alias(query)),
            ("countrycodes", self.country_codes.clone()),
            ("limit", "10".to_string()),
            ("addressdetails", "1".to_string()),
        ];
        if let Some(user) = near {
            params.push(("lat", user.lat.to_string()));
            params.push(("lon", user.lng.to_string()));
            params.push((
                "viewbox",
                format!(
                    "{},{},{},{}",
                    user.lng - VIEWBOX_DELTA,
                    user.lat + VIEWBOX_DELTA,
                    user.lng + VIEWBOX_DELTA,
                    user.lat - VIEWBOX_DELTA
                ),
            ));
            params.push(("bounded", "0".to_string()));
        }

        let places = self.search(&params).await?;

        let mut suggestions: Vec<Suggestion> = places
            .into_iter()
            .filter_map(|place| {
                let coords = place.coords()?;
                let display_name = place
                    .address
                    .as_ref()
                    .and_then(|address| address.label())
                    .or(place.display_name)?;
                let distance = near.map(|user| haversine_km(user, coords)).unwrap_or(0.0);
                Some(Suggestion {
                    display_name,
                    coords,
                    distance,
                })
            })
            .collect();

        suggestions.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_expand_alone_and_as_prefix() {
        assert_eq!(expand_alias("sumc"), "Silliman University Medical Center");
        assert_eq!(expand_alias("SM City"), "SM Mall City");
        assert_eq!(expand_alias("Rizal Boulevard"), "Rizal Boulevard");
    }

    #[test]
    fn aliases_keep_non_ascii_tails_intact() {
        assert_eq!(expand_alias("SU ıbrahim street"), "Silliman University ıbrahim street");
        assert_eq!(expand_alias("  su   Ñoño Street "), "Silliman University Ñoño Street");
        assert_eq!(expand_alias("ßtraße"), "ßtraße");
    }

    #[test]
    fn reverse_cache_starts_over_when_full() {
        let mut cache = HashMap::new();
        for i in 0..REVERSE_CACHE_LIMIT {
            remember_label(&mut cache, i.to_string(), "Rizal Boulevard".to_string());
        }
        assert_eq!(cache.len(), REVERSE_CACHE_LIMIT);

        remember_label(&mut cache, "9.30680,123.30540".to_string(), "Quezon Park".to_string());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("9.30680,123.30540").map(String::as_str), Some("Quezon Park"));
    }

    #[test]
    fn named_places_win_over_roads() {
        let parts = AddressParts {
            university: Some("Silliman University".to_string()),
            road: Some("Hibbard Avenue".to_string()),
            ..Default::default()
        };
        assert_eq!(parts.label(), Some("Silliman University, Hibbard Avenue".to_string()));

        let parts = AddressParts {
            road: Some("Perdices Street".to_string()),
            city: Some("Dumaguete".to_string()),
            ..Default::default()
        };
        assert_eq!(parts.label(), Some("Perdices Street, Dumaguete".to_string()));

        assert_eq!(AddressParts::default().label(), None);
    }
}
