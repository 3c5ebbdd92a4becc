use crate::catalog::CatalogSearchProvider;
use crate::config::AppConfig;
use crate::fusion::{FusionService, FusionState};
use crate::geometry;
use crate::indicators::CsvIndicatorService;
use crate::proximity::ProximityAggregator;
use crate::repository::MunicipalityRepository;
use crate::risk::{DecisionTreeClassifier, HazardAssessment, RiskAssessor};
use crate::types::Municipality;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use geo::Coord;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

pub struct AppState {
    pub fusion: FusionService,
    pub assessor: RiskAssessor,
}

impl AppState {
    /// Wires the file-backed collaborators named in the configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let repository = MunicipalityRepository::from_path(&config.input.boundaries)
            .context("Failed to load boundary dataset")?;
        let indicators = CsvIndicatorService::from_path(
            &config.input.indicators_csv,
            &config.input.join_column_csv,
            &config.indicators,
        )?;
        let catalog = CatalogSearchProvider::from_path(&config.input.poi_catalog)?;
        let classifier = DecisionTreeClassifier::from_path(&config.input.classifier_model)?;

        let aggregator = ProximityAggregator::new(Arc::new(catalog))
            .with_timeout(config.proximity.search_timeout());
        let fusion = FusionService::new(Arc::new(repository), Arc::new(indicators), aggregator)
            .with_categories(config.proximity.categories.clone())
            .with_indicator_timeout(config.proximity.indicator_timeout());

        Ok(Self {
            fusion,
            assessor: RiskAssessor::new(Arc::new(classifier)),
        })
    }

    /// Current fusion state plus, once a snapshot exists, its assessment.
    pub async fn report(&self) -> AssessmentReport {
        let state = self.fusion.state();
        let assessment = match &state {
            FusionState::Ready { snapshot } | FusionState::Failed { snapshot, .. } => {
                Some(self.assessor.assess_offloaded(snapshot.clone()).await)
            }
            _ => None,
        };
        AssessmentReport { state, assessment }
    }
}

#[derive(Debug, Serialize)]
pub struct AssessmentReport {
    pub state: FusionState,
    pub assessment: Option<HazardAssessment>,
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
pub struct SelectionRequest {
    code: String,
}

#[derive(Serialize)]
pub struct MunicipalityResponse {
    #[serde(flatten)]
    municipality: Municipality,
    /// [lon, lat]
    centroid: Option<[f64; 2]>,
}

impl From<&Municipality> for MunicipalityResponse {
    fn from(municipality: &Municipality) -> Self {
        let centroid = municipality
            .polygon
            .as_ref()
            .and_then(geometry::centroid)
            .map(|c| [c.x, c.y]);
        Self {
            municipality: municipality.clone(),
            centroid,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/municipalities/:code", get(municipality_handler))
        .route("/api/query", get(query_handler))
        .route("/api/selection", post(selection_handler))
        .route("/api/state", get(state_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: &AppConfig, state: Arc<AppState>) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn municipality_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<MunicipalityResponse>, StatusCode> {
    state
        .fusion
        .repository()
        .get(&code)
        .map(|m| Json(m.into()))
        .map_err(|_| StatusCode::NOT_FOUND)
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<MunicipalityResponse>> {
    let point = Coord { x: params.lon, y: params.lat };
    Json(state.fusion.repository().locate(point).map(Into::into))
}

async fn selection_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectionRequest>,
) -> Json<AssessmentReport> {
    // A superseded cycle publishes nothing; the report then reflects the
    // newer selection.
    state.fusion.select_and_fuse(request.code).await;
    Json(state.report().await)
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Json<AssessmentReport> {
    Json(state.report().await)
}
