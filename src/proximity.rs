use crate::geometry::{self, Coordinate, Polygon};
use crate::repository::MunicipalityRepository;
use crate::types::{Municipality, ProximityMetric};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Radius used when a municipality's city area is unknown.
pub const DEFAULT_SEARCH_RADIUS_KM: f64 = 50.0;

/// Circular search scope. Always a superset of the municipality; results
/// are filtered against the polygon afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchRegion {
    pub center: Coordinate,
    pub radius_km: f64,
}

/// `sqrt(area)` kilometres, i.e. the side of a square of the same area.
pub fn search_radius_km(city_area_km2: Option<f64>) -> f64 {
    match city_area_km2 {
        Some(area) if area.is_finite() && area > 0.0 => area.sqrt(),
        _ => DEFAULT_SEARCH_RADIUS_KM,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceMatch {
    pub name: String,
    pub coordinate: Coordinate,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search provider failed: {0}")]
    Provider(String),
    #[error("search for {category:?} timed out after {timeout:?}")]
    Timeout { category: String, timeout: Duration },
}

/// Free-text categorized search over a region. Results come back unordered
/// and may be empty.
#[async_trait]
pub trait ProximitySearchProvider: Send + Sync {
    async fn search(&self, category: &str, region: SearchRegion) -> Result<Vec<PlaceMatch>, SearchError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProximityReport {
    pub metrics: BTreeMap<String, ProximityMetric>,
    /// Categories reported as empty because their search failed.
    pub failed: Vec<String>,
}

impl ProximityReport {
    pub fn all_failed(&self) -> bool {
        !self.metrics.is_empty() && self.metrics.keys().all(|category| self.failed.contains(category))
    }
}

#[derive(Clone)]
pub struct ProximityAggregator {
    provider: Arc<dyn ProximitySearchProvider>,
    timeout: Option<Duration>,
}

impl ProximityAggregator {
    pub fn new(provider: Arc<dyn ProximitySearchProvider>) -> Self {
        Self { provider, timeout: None }
    }

    /// Per-category deadline; expiry counts as a failed search.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one search per category concurrently and returns once every
    /// search has resolved. A failed category reports an empty metric and
    /// leaves the others untouched.
    pub async fn aggregate(&self, municipality: &Municipality, categories: &[String]) -> ProximityReport {
        let mut report = ProximityReport::default();
        // Repeated categories are searched once.
        let mut seen = BTreeSet::new();
        let categories: Vec<&String> = categories.iter().filter(|c| seen.insert(c.as_str())).collect();

        let scope = municipality
            .polygon
            .as_ref()
            .zip(MunicipalityRepository::derive_region(municipality));
        let Some((polygon, region)) = scope else {
            warn!(code = %municipality.code, "No boundary polygon, proximity searches skipped");
            for category in categories {
                report.metrics.insert(category.clone(), ProximityMetric::default());
                report.failed.push(category.clone());
            }
            return report;
        };

        debug!(
            code = %municipality.code,
            lon = region.center.x,
            lat = region.center.y,
            radius_km = region.radius_km,
            "Searching {} categories",
            categories.len()
        );

        let searches = categories
            .iter()
            .map(|category| self.search_category(category, polygon, region));
        let outcomes = join_all(searches).await;

        for (category, outcome) in categories.into_iter().zip(outcomes) {
            let metric = match outcome {
                Ok(metric) => metric,
                Err(err) => {
                    warn!(code = %municipality.code, category = %category, error = %err, "Category search failed");
                    report.failed.push(category.clone());
                    ProximityMetric::default()
                }
            };
            report.metrics.insert(category.clone(), metric);
        }

        report
    }

    async fn search_category(
        &self,
        category: &str,
        polygon: &Polygon,
        region: SearchRegion,
    ) -> Result<ProximityMetric, SearchError> {
        let request = self.provider.search(category, region);
        let places = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, request)
                .await
                .map_err(|_| SearchError::Timeout { category: category.to_string(), timeout })??,
            None => request.await?,
        };

        Ok(summarize(region.center, polygon, &places))
    }
}

/// Count and mean centroid distance of the places inside the polygon.
fn summarize(center: Coordinate, polygon: &Polygon, places: &[PlaceMatch]) -> ProximityMetric {
    let distances: Vec<f64> = places
        .iter()
        .filter(|place| geometry::contains(polygon, place.coordinate))
        .map(|place| geometry::distance_km(center, place.coordinate))
        .collect();

    if distances.is_empty() {
        return ProximityMetric::default();
    }

    ProximityMetric {
        count: distances.len(),
        mean_distance_km: distances.iter().sum::<f64>() / distances.len() as f64,
    }
}
