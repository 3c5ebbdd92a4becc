use crate::geometry::{self, Coordinate, GeometryError, Polygon};
use crate::proximity::{search_radius_km, SearchRegion};
use crate::types::{HazardAttributes, Municipality};
use geojson::{Feature, JsonObject, JsonValue, Value};
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("municipality {0:?} not found")]
    NotFound(String),
    #[error("failed to read boundary dataset {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("boundary dataset is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("boundary dataset must be a FeatureCollection with a features array")]
    NotFeatureCollection,
}

/// Why a single feature was skipped during load.
#[derive(Debug, Error)]
enum FeatureError {
    #[error("not a GeoJSON feature: {0}")]
    Geojson(#[from] geojson::Error),
    #[error("missing {0:?} property")]
    MissingProperty(&'static str),
    #[error("malformed geometry: {0}")]
    Geometry(#[from] GeometryError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub skipped: usize,
}

// Bounding-box entry for the point lookup index.
struct MunicipalityEnvelope {
    code: String,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for MunicipalityEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Read-mostly cache of municipality records keyed by code.
pub struct MunicipalityRepository {
    records: HashMap<String, Municipality>,
    tree: RTree<MunicipalityEnvelope>,
}

impl Default for MunicipalityRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MunicipalityRepository {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            tree: RTree::new(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, RepositoryError> {
        let mut repository = Self::new();
        repository.load_from_path(path)?;
        Ok(repository)
    }

    pub fn load_from_path(&mut self, path: &Path) -> Result<LoadSummary, RepositoryError> {
        info!("Loading boundaries from {:?}...", path);
        let content = fs::read_to_string(path).map_err(|source| RepositoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load(&content)
    }

    /// Replaces the repository contents with the features of a GeoJSON
    /// FeatureCollection. A feature that fails to decode is skipped and the
    /// load carries on; only a document that is not a FeatureCollection
    /// fails as a whole.
    pub fn load(&mut self, document: &str) -> Result<LoadSummary, RepositoryError> {
        let document: JsonValue = serde_json::from_str(document)?;
        let mut object = match document {
            JsonValue::Object(object) => object,
            _ => return Err(RepositoryError::NotFeatureCollection),
        };
        if object.get("type").and_then(JsonValue::as_str) != Some("FeatureCollection") {
            return Err(RepositoryError::NotFeatureCollection);
        }
        let features = match object.remove("features") {
            Some(JsonValue::Array(features)) => features,
            _ => return Err(RepositoryError::NotFeatureCollection),
        };

        let decoded: Vec<Result<Municipality, FeatureError>> =
            features.into_par_iter().map(decode_feature).collect();

        let mut records = HashMap::with_capacity(decoded.len());
        let mut summary = LoadSummary::default();
        for (index, result) in decoded.into_iter().enumerate() {
            match result {
                Ok(municipality) if records.contains_key(&municipality.code) => {
                    warn!(feature = index, code = %municipality.code, "Duplicate municipality code, keeping first");
                    summary.skipped += 1;
                }
                Ok(municipality) => {
                    records.insert(municipality.code.clone(), municipality);
                    summary.loaded += 1;
                }
                Err(err) => {
                    warn!(feature = index, error = %err, "Skipping boundary feature");
                    summary.skipped += 1;
                }
            }
        }

        let envelopes: Vec<MunicipalityEnvelope> = records
            .values()
            .filter_map(|m| {
                let rect = m.polygon.as_ref()?.bounding_rect()?;
                Some(MunicipalityEnvelope {
                    code: m.code.clone(),
                    aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                })
            })
            .collect();

        self.tree = RTree::bulk_load(envelopes);
        self.records = records;

        info!(loaded = summary.loaded, skipped = summary.skipped, "Boundary dataset loaded");
        Ok(summary)
    }

    pub fn get(&self, code: &str) -> Result<&Municipality, RepositoryError> {
        self.records
            .get(code)
            .ok_or_else(|| RepositoryError::NotFound(code.to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Search scope for proximity queries: vertex-mean centroid plus the
    /// area-derived radius. `None` without a usable polygon.
    pub fn derive_region(municipality: &Municipality) -> Option<SearchRegion> {
        let center = geometry::centroid(municipality.polygon.as_ref()?)?;
        Some(SearchRegion {
            center,
            radius_km: search_radius_km(municipality.hazard.city_area_km2),
        })
    }

    /// The municipality whose outer ring contains `point`.
    pub fn locate(&self, point: Coordinate) -> Option<&Municipality> {
        let envelope = AABB::from_point([point.x, point.y]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|candidate| self.records.get(&candidate.code))
            .find(|m| {
                m.polygon
                    .as_ref()
                    .is_some_and(|polygon| geometry::contains(polygon, point))
            })
    }
}

fn decode_feature(value: JsonValue) -> Result<Municipality, FeatureError> {
    let feature = Feature::from_json_value(value)?;
    let empty = JsonObject::new();
    let props = feature.properties.as_ref().unwrap_or(&empty);

    let code = string_prop(props, "code").ok_or(FeatureError::MissingProperty("code"))?;
    let name = string_prop(props, "name").ok_or(FeatureError::MissingProperty("name"))?;

    let polygon = match feature.geometry.map(|g| g.value) {
        Some(Value::Polygon(rings)) => Some(Polygon::from_positions(&rings)?),
        Some(Value::MultiPolygon(polygons)) => polygons
            .first()
            .map(|rings| Polygon::from_positions(rings))
            .transpose()?,
        // Points and lines carry no boundary.
        Some(_) | None => None,
    };

    Ok(Municipality {
        code,
        name,
        region: string_prop(props, "region"),
        polygon,
        hazard: HazardAttributes {
            city_area_km2: number_prop(props, "city_area_km2"),
            inundated_area_km2: number_prop(props, "inundated_area_km2"),
            vulnerable_population: count_prop(props, "vulnerable_population"),
            vulnerability_index: string_prop(props, "vulnerability_index"),
            flood_hazard: string_prop(props, "hazard"),
            threshold_12h_mm: number_prop(props, "threshold_12h_mm"),
            inundated_pct: number_prop(props, "inundated_pct"),
        },
    })
}

fn string_prop(props: &JsonObject, key: &str) -> Option<String> {
    match props.get(key)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_prop(props: &JsonObject, key: &str) -> Option<f64> {
    let value = match props.get(key)? {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

fn count_prop(props: &JsonObject, key: &str) -> Option<u64> {
    let value = number_prop(props, key)?;
    (value >= 0.0 && value.fract() == 0.0).then_some(value as u64)
}
