use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json,
    Router,
};
use data_model::{AppId, DropletEntry};
use serde::Serialize;
use tracing::error;

use crate::{
    catalog::Catalog,
    health_manager::{HealthManager, Varz},
    placement::pool::DeaPool,
};

#[derive(Debug)]
pub struct ApiError {
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

#[derive(Clone)]
pub struct RouteState {
    pub health_manager: Arc<HealthManager>,
    pub pool: Arc<DeaPool>,
    pub catalog: Arc<Catalog>,
}

#[derive(Debug, Serialize)]
pub struct VarzResponse {
    #[serde(flatten)]
    pub health_manager: Varz,
    pub pool_size: usize,
    pub runtimes: usize,
    pub frameworks: usize,
}

pub fn create_routes(route_state: RouteState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/varz", get(varz))
        .route("/varz/droplets/{app_id}", get(droplet))
        .with_state(route_state)
}

async fn index() -> &'static str {
    "Health Manager"
}

async fn healthz() -> &'static str {
    "ok"
}

async fn varz(State(state): State<RouteState>) -> Json<VarzResponse> {
    let (runtimes, frameworks) = state.catalog.counts();
    Json(VarzResponse {
        health_manager: state.health_manager.varz().await,
        pool_size: state.pool.len().await,
        runtimes,
        frameworks,
    })
}

async fn droplet(
    Path(app_id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<DropletEntry>, ApiError> {
    state
        .health_manager
        .droplet(&AppId::new(app_id))
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("droplet not found"))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use data_model::test_objects::tests::{mock_app, mock_heartbeat};

    use super::*;
    use crate::testing::TestService;

    #[tokio::test]
    async fn test_varz_reports_registry_and_pool() -> Result<()> {
        let test_srv = TestService::new().await?;
        let app = mock_app("1", 2);
        test_srv.store.upsert(app.clone()).await;
        test_srv.service.health_manager.update_from_desired_state().await?;
        test_srv
            .service
            .health_manager
            .process_heartbeat(&mock_heartbeat(&app, &[0, 1], test_srv.now_secs()))
            .await;
        test_srv.service.health_manager.analyze_all_apps().await;

        let Json(varz) = varz(State(test_srv.service.route_state())).await;
        assert_eq!(varz.health_manager.droplets, 1);
        assert_eq!(varz.health_manager.stats.running, 2);
        assert_eq!(varz.pool_size, 0);
        assert!(!varz.health_manager.analysis_in_progress);

        let value = serde_json::to_value(&varz)?;
        assert_eq!(value["partition"], "default");
        assert_eq!(value["queue_length"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_droplet_lookup() -> Result<()> {
        let test_srv = TestService::new().await?;
        test_srv.store.upsert(mock_app("1", 1)).await;
        test_srv.service.health_manager.update_from_desired_state().await?;

        let route_state = test_srv.service.route_state();
        let Json(entry) = droplet(Path("1".to_string()), State(route_state.clone()))
            .await
            .unwrap();
        assert_eq!(entry.instance_count, 1);

        let missing = droplet(Path("2".to_string()), State(route_state)).await;
        assert_eq!(missing.unwrap_err().status_code, StatusCode::NOT_FOUND);
        Ok(())
    }
}
