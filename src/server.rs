use crate::cluster::ClusterView;
use crate::config::AppConfig;
use crate::forecast::{ForecastError, HourlyForecast, IncidentLog};
use crate::geocode::Geocoder;
use crate::markers::CircleOverlay;
use crate::pipeline::{load_dataset, LoadReport};
use crate::session::{Activation, MapSession};
use crate::types::{LatLng, ViewState};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

pub struct AppState<G> {
    pub config: AppConfig,
    pub geocoder: G,
    pub session: RwLock<MapSession>,
    /// Held by a reload from fetch to swap; one dataset loads at a time.
    pub load_guard: Mutex<()>,
    pub incident_log: Option<IncidentLog>,
}

type SharedState<G> = Arc<AppState<G>>;
type ApiError = (StatusCode, String);

#[derive(Serialize)]
pub struct SessionResponse {
    dataset: String,
    view: ViewState,
    markers: usize,
    visible: usize,
    active_overlay: Option<CircleOverlay>,
    report: LoadReport,
}

#[derive(Serialize)]
pub struct MarkerResponse {
    id: usize,
    position: LatLng,
    title: String,
    label: Option<String>,
}

#[derive(Deserialize)]
pub struct ClusterParams {
    zoom: Option<u8>,
}

#[derive(Deserialize)]
pub struct FilterRequest {
    category: String,
}

#[derive(Serialize)]
pub struct FilterResponse {
    visible: usize,
    clustered: usize,
    clusters: ClusterView,
}

#[derive(Deserialize)]
pub struct ReloadRequest {
    dataset: String,
    source: Option<String>,
}

#[derive(Deserialize)]
pub struct PredictRequest {
    category: String,
    month: u32,
    day: u32,
}

/// Loads the initial dataset, then serves the API and the static page.
/// A failed initial load leaves the map empty but the server still starts.
pub async fn start_server<G>(config: AppConfig, geocoder: G) -> Result<()>
where
    G: Geocoder + Send + Sync + 'static,
{
    let incident_log = match &config.forecast {
        Some(forecast) => Some(IncidentLog::load(&forecast.incidents_csv)?),
        None => None,
    };

    let name = config.map.default_dataset.clone();
    let mut session = MapSession::new(&config, &name, config.dataset(&name)?);
    match load_dataset(&config, &name, None, &geocoder).await {
        Ok(loaded) => session.install(loaded),
        Err(e) => error!(dataset = %name, error = ?e, "Initial load failed"),
    }

    let port = config.server.port;
    let static_dir = config.server.static_dir.clone();
    let state = Arc::new(AppState {
        config,
        geocoder,
        session: RwLock::new(session),
        load_guard: Mutex::new(()),
        incident_log,
    });

    let app = router(state).fallback_service(ServeDir::new(static_dir));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router<G>(state: SharedState<G>) -> Router
where
    G: Geocoder + Send + Sync + 'static,
{
    Router::new()
        .route("/api/session", get(session_handler::<G>))
        .route("/api/markers", get(markers_handler::<G>))
        .route("/api/clusters", get(clusters_handler::<G>))
        .route("/api/filter", post(filter_handler::<G>))
        .route("/api/markers/:id/activate", post(activate_handler::<G>))
        .route("/api/reload", post(reload_handler::<G>))
        .route("/api/predict", post(predict_handler::<G>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn summarize(session: &MapSession) -> SessionResponse {
    SessionResponse {
        dataset: session.dataset().to_string(),
        view: session.view(),
        markers: session.markers().len(),
        visible: session.visible_markers().count(),
        active_overlay: session.active_overlay().cloned(),
        report: session.report().clone(),
    }
}

async fn session_handler<G: Send + Sync + 'static>(State(state): State<SharedState<G>>) -> Json<SessionResponse> {
    let session = state.session.read().await;
    Json(summarize(&session))
}

async fn markers_handler<G: Send + Sync + 'static>(State(state): State<SharedState<G>>) -> Json<Vec<MarkerResponse>> {
    let session = state.session.read().await;
    let markers = session
        .visible_markers()
        .map(|m| MarkerResponse {
            id: m.id,
            position: m.position(),
            title: m.title.clone(),
            label: m.label.clone(),
        })
        .collect();
    Json(markers)
}

async fn clusters_handler<G: Send + Sync + 'static>(
    State(state): State<SharedState<G>>,
    Query(params): Query<ClusterParams>,
) -> Json<ClusterView> {
    let mut session = state.session.write().await;
    if let Some(zoom) = params.zoom {
        session.set_zoom(zoom);
    }
    Json(session.clusters().clone())
}

async fn filter_handler<G: Send + Sync + 'static>(
    State(state): State<SharedState<G>>,
    Json(request): Json<FilterRequest>,
) -> Json<FilterResponse> {
    let mut session = state.session.write().await;
    let visible = session.apply_filter(&request.category);
    let clusters = session.clusters();
    Json(FilterResponse {
        visible,
        clustered: clusters.marker_count(),
        clusters: clusters.clone(),
    })
}

async fn activate_handler<G: Send + Sync + 'static>(
    State(state): State<SharedState<G>>,
    Path(id): Path<usize>,
) -> Result<Json<Activation>, ApiError> {
    let mut session = state.session.write().await;
    session
        .activate(id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No marker with id {}", id)))
}

/// Runs the whole pipeline for another dataset. Reloads queue on the load
/// guard; the session lock is only taken to swap the finished session in.
async fn reload_handler<G>(
    State(state): State<SharedState<G>>,
    Json(request): Json<ReloadRequest>,
) -> Result<Json<SessionResponse>, ApiError>
where
    G: Geocoder + Send + Sync + 'static,
{
    let config = &state.config;
    let dataset = config
        .dataset(&request.dataset)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    if let Some(source) = request.source.as_deref() {
        if !dataset.allows_source(source) {
            warn!(dataset = %request.dataset, source, "Rejected reload from unlisted source");
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Source {:?} is not configured for dataset {}", source, request.dataset),
            ));
        }
    }

    let _loading = state.load_guard.lock().await;
    info!(dataset = %request.dataset, "Reloading map");

    let mut fresh = MapSession::new(config, &request.dataset, dataset);
    match load_dataset(config, &request.dataset, request.source.as_deref(), &state.geocoder).await {
        Ok(loaded) => fresh.install(loaded),
        Err(e) => error!(dataset = %request.dataset, error = ?e, "Reload failed"),
    }

    let mut session = state.session.write().await;
    *session = fresh;
    Ok(Json(summarize(&session)))
}

async fn predict_handler<G: Send + Sync + 'static>(
    State(state): State<SharedState<G>>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<HourlyForecast>, ApiError> {
    let (log, forecast_config) = match (&state.incident_log, &state.config.forecast) {
        (Some(log), Some(cfg)) => (log, cfg),
        _ => {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "Forecasting is not configured".to_string(),
            ))
        }
    };

    log.forecast(&request.category, request.month, request.day, forecast_config.target_year)
        .map(Json)
        .map_err(|e| {
            let status = match e {
                ForecastError::UnknownCategory(_) => StatusCode::NOT_FOUND,
                ForecastError::InsufficientHistory(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ForecastError::InvalidDate { .. } => StatusCode::BAD_REQUEST,
            };
            (status, e.to_string())
        })
}
