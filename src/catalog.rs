use crate::geometry::{self, Coordinate};
use crate::proximity::{PlaceMatch, ProximitySearchProvider, SearchError, SearchRegion};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use geo::Coord;
use geojson::{GeoJson, Value};
use rstar::{RTree, RTreeObject, AABB};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, warn};

/// Mean earth radius in metres; mirrors geo's private `MEAN_EARTH_RADIUS` used by haversine.
const MEAN_EARTH_RADIUS: f64 = 6371008.8;

/// Relative slack on the box so float rounding never clips the circle edge.
const BOX_PADDING: f64 = 1.0 + 1e-6;

struct CatalogEntry {
    name: String,
    category: String,
    coordinate: Coordinate,
}

impl RTreeObject for CatalogEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.coordinate.x, self.coordinate.y])
    }
}

impl CatalogEntry {
    fn matches(&self, query: &str) -> bool {
        self.category == query || self.name.to_lowercase().contains(query)
    }
}

/// Proximity search backed by a local GeoJSON catalog of named, categorized
/// points (hospitals, police stations, fire stations...).
pub struct CatalogSearchProvider {
    tree: RTree<CatalogEntry>,
}

impl CatalogSearchProvider {
    pub fn from_path(path: &Path) -> Result<Self> {
        info!("Loading point catalog from {:?}...", path);
        let file = File::open(path)
            .with_context(|| format!("Failed to open point catalog: {:?}", path))?;
        let geojson = GeoJson::from_reader(BufReader::new(file)).context("Failed to parse point catalog GeoJSON")?;
        Self::from_geojson(geojson)
    }

    pub fn from_geojson(geojson: GeoJson) -> Result<Self> {
        let collection = match geojson {
            GeoJson::FeatureCollection(fc) => fc,
            _ => return Err(anyhow!("Point catalog must be a FeatureCollection")),
        };

        let mut entries = Vec::new();
        for feature in collection.features {
            let position = match feature.geometry.map(|g| g.value) {
                Some(Value::Point(position)) if position.len() >= 2 => position,
                _ => continue,
            };
            let props = feature.properties.unwrap_or_default();
            let Some(category) = props.get("category").and_then(|v| v.as_str()) else {
                warn!("Skipping catalog point without category");
                continue;
            };

            entries.push(CatalogEntry {
                name: props.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                category: category.trim().to_lowercase(),
                coordinate: Coord { x: position[0], y: position[1] },
            });
        }

        info!("Building spatial index for {} catalog points...", entries.len());
        Ok(Self { tree: RTree::bulk_load(entries) })
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

#[async_trait]
impl ProximitySearchProvider for CatalogSearchProvider {
    async fn search(&self, category: &str, region: SearchRegion) -> Result<Vec<PlaceMatch>, SearchError> {
        let query = category.trim().to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let matches: Vec<PlaceMatch> = search_envelopes(&region)
            .iter()
            .flat_map(|envelope| self.tree.locate_in_envelope(envelope))
            .filter(|entry| entry.matches(&query))
            .filter(|entry| geometry::distance_km(region.center, entry.coordinate) <= region.radius_km)
            .map(|entry| PlaceMatch {
                name: entry.name.clone(),
                coordinate: entry.coordinate,
            })
            .collect();

        debug!(category = %query, found = matches.len(), "Catalog search");
        Ok(matches)
    }
}

/// Degree boxes covering the search circle on the same sphere `distance_km`
/// measures on. A circle reaching a pole takes the full longitude range; one
/// crossing ±180° is split into a box on each side.
fn search_envelopes(region: &SearchRegion) -> Vec<AABB<[f64; 2]>> {
    let angular = region.radius_km / (MEAN_EARTH_RADIUS / 1000.0);
    let dlat = angular.to_degrees() * BOX_PADDING;
    let lat = region.center.y;
    let (south, north) = ((lat - dlat).max(-90.0), (lat + dlat).min(90.0));

    let dlon = if lat.abs() + dlat >= 90.0 || angular >= std::f64::consts::FRAC_PI_2 {
        180.0
    } else {
        let half_width = (angular.sin() / lat.to_radians().cos()).min(1.0).asin();
        half_width.to_degrees() * BOX_PADDING
    };
    if dlon >= 180.0 {
        return vec![AABB::from_corners([-180.0, south], [180.0, north])];
    }

    let (west, east) = (region.center.x - dlon, region.center.x + dlon);
    let mut envelopes = vec![AABB::from_corners([west.max(-180.0), south], [east.min(180.0), north])];
    if west < -180.0 {
        envelopes.push(AABB::from_corners([west + 360.0, south], [180.0, north]));
    }
    if east > 180.0 {
        envelopes.push(AABB::from_corners([-180.0, south], [east - 360.0, north]));
    }
    envelopes
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature", "geometry": { "type": "Point", "coordinates": [-102.29, 21.88] },
              "properties": { "name": "Hospital Hidalgo", "category": "Hospital" } },
            { "type": "Feature", "geometry": { "type": "Point", "coordinates": [-102.30, 21.90] },
              "properties": { "name": "Cruz Roja", "category": "clinic" } },
            { "type": "Feature", "geometry": { "type": "Point", "coordinates": [-102.28, 21.87] },
              "properties": { "name": "Estacion Centro", "category": "police" } },
            { "type": "Feature", "geometry": { "type": "Point", "coordinates": [-99.13, 19.43] },
              "properties": { "name": "Hospital Lejano", "category": "hospital" } },
            { "type": "Feature", "geometry": { "type": "Point", "coordinates": [-102.29, 21.88] },
              "properties": { "name": "Sin categoria" } },
            { "type": "Feature", "geometry": null, "properties": { "category": "hospital" } }
        ]
    }"#;

    fn provider() -> CatalogSearchProvider {
        CatalogSearchProvider::from_geojson(CATALOG.parse().unwrap()).unwrap()
    }

    fn region() -> SearchRegion {
        SearchRegion { center: Coord { x: -102.29, y: 21.88 }, radius_km: 30.0 }
    }

    #[test]
    fn test_only_points_with_category_are_indexed() {
        assert_eq!(provider().len(), 4);
    }

    #[tokio::test]
    async fn test_search_by_category_within_radius() {
        let found = provider().search("hospital", region()).await.unwrap();
        let names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Hospital Hidalgo"]);
    }

    #[tokio::test]
    async fn test_search_matches_names_case_insensitively() {
        let found = provider().search("  CRUZ roja ", region()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Cruz Roja");
    }

    #[tokio::test]
    async fn test_empty_results_are_ok() {
        assert!(provider().search("fire", region()).await.unwrap().is_empty());
        assert!(provider().search("   ", region()).await.unwrap().is_empty());
    }

    fn single_hospital(lon: f64, lat: f64) -> CatalogSearchProvider {
        let catalog = format!(
            r#"{{"type": "FeatureCollection", "features": [{{
                "type": "Feature", "geometry": {{ "type": "Point", "coordinates": [{lon}, {lat}] }},
                "properties": {{ "name": "Hospital", "category": "hospital" }}
            }}]}}"#
        );
        CatalogSearchProvider::from_geojson(catalog.parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_point_just_inside_radius_is_found() {
        let provider = single_hospital(0.0, 0.4494);
        let center = Coord { x: 0.0, y: 0.0 };
        assert!(geometry::distance_km(center, Coord { x: 0.0, y: 0.4494 }) < 50.0);

        let found = provider.search("hospital", SearchRegion { center, radius_km: 50.0 }).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_search_wraps_across_antimeridian() {
        let provider = single_hospital(-179.9, 0.0);
        let region = SearchRegion { center: Coord { x: 179.9, y: 0.0 }, radius_km: 30.0 };
        assert_eq!(provider.search("hospital", region).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_near_pole_covers_all_longitudes() {
        let provider = single_hospital(170.0, 89.95);
        let region = SearchRegion { center: Coord { x: 0.0, y: 89.9 }, radius_km: 30.0 };
        assert_eq!(provider.search("hospital", region).await.unwrap().len(), 1);
    }

    #[test]
    fn test_non_collection_is_rejected() {
        let point: GeoJson = r#"{"type": "Point", "coordinates": [0.0, 0.0]}"#.parse().unwrap();
        assert!(CatalogSearchProvider::from_geojson(point).is_err());
    }
}
