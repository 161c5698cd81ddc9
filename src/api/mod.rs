//! Client-facing HTTP API
//!
//! Provides REST endpoints over the controller:
//! - Computes: register, list, probe, remove
//! - Projects: open, load, snapshot, close, delete
//! - Nodes, links, captures and drawings of a project
//! - Notification streams (newline-delimited JSON and websocket)

mod notifications;
mod topology;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;
use uuid::Uuid;

use crate::compute::{ComputeDescriptor, ComputeHost};
use crate::controller::Controller;
use crate::error::{ErrorClass, ErrorKind, OrchestratorError};
use crate::topology::{Project, ProjectSnapshot};

/// Shared state for the API
#[derive(Clone)]
pub struct ApiState {
    pub controller: Controller,
}

impl ApiState {
    pub fn new(controller: Controller) -> Self {
        Self { controller }
    }
}

/// Create the API router
pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/v2/version", get(version))
        // Computes
        .route("/v2/computes", get(list_computes).post(add_compute))
        .route(
            "/v2/computes/{compute_id}",
            get(get_compute).delete(remove_compute),
        )
        .route("/v2/computes/{compute_id}/probe", post(probe_compute))
        // Projects
        .route("/v2/projects", get(list_projects).post(open_project))
        .route(
            "/v2/projects/{project_id}",
            get(get_project).delete(delete_project),
        )
        .route("/v2/projects/{project_id}/close", post(close_project))
        .route("/v2/projects/{project_id}/load", post(load_project))
        .route("/v2/projects/{project_id}/snapshot", get(project_snapshot))
        // Nodes
        .route(
            "/v2/projects/{project_id}/nodes",
            get(topology::list_nodes).post(topology::create_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}",
            get(topology::get_node)
                .put(topology::update_node)
                .delete(topology::delete_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/start",
            post(topology::start_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/stop",
            post(topology::stop_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/suspend",
            post(topology::suspend_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/resume",
            post(topology::resume_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/reload",
            post(topology::reload_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/reconcile",
            post(topology::reconcile_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/duplicate",
            post(topology::duplicate_node),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/idlepc",
            post(topology::auto_idle_pc),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/adapters/{adapter}/ports/{port}/capture/start",
            post(topology::start_port_capture),
        )
        .route(
            "/v2/projects/{project_id}/nodes/{node_id}/adapters/{adapter}/ports/{port}/capture/stop",
            post(topology::stop_port_capture),
        )
        // Links
        .route(
            "/v2/projects/{project_id}/links",
            get(topology::list_links).post(topology::create_link),
        )
        .route(
            "/v2/projects/{project_id}/links/establish",
            post(topology::establish_links),
        )
        .route(
            "/v2/projects/{project_id}/links/{link_id}",
            get(topology::get_link)
                .put(topology::update_link)
                .delete(topology::delete_link),
        )
        .route(
            "/v2/projects/{project_id}/links/{link_id}/establish",
            post(topology::establish_link),
        )
        .route(
            "/v2/projects/{project_id}/links/{link_id}/capture/start",
            post(topology::start_link_capture),
        )
        .route(
            "/v2/projects/{project_id}/links/{link_id}/capture/stop",
            post(topology::stop_link_capture),
        )
        // Drawings
        .route(
            "/v2/projects/{project_id}/drawings",
            get(topology::list_drawings).post(topology::create_drawing),
        )
        .route(
            "/v2/projects/{project_id}/drawings/{drawing_id}",
            put(topology::update_drawing).delete(topology::delete_drawing),
        )
        // Notifications
        .route(
            "/v2/projects/{project_id}/notifications",
            get(notifications::project_stream),
        )
        .route(
            "/v2/projects/{project_id}/notifications/ws",
            get(notifications::project_websocket),
        )
        .route("/v2/notifications", get(notifications::controller_stream))
        .route("/v2/notifications/ws", get(notifications::controller_websocket))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// Controller error rendered as `{status, kind, class, message}`
#[derive(Debug)]
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub kind: ErrorKind,
    pub class: ErrorClass,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }

        let body = ErrorBody {
            status: status.as_u16(),
            kind,
            class: kind.class(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Parse a request body whose every field is optional; empty means default
pub(crate) fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| OrchestratorError::InvalidInput(format!("malformed body: {}", e)).into())
}

// ============================================================================
// Health & Version
// ============================================================================

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    #[serde(rename = "protocolVersion")]
    protocol_version: String,
}

async fn version(State(state): State<ApiState>) -> impl IntoResponse {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: state.controller.registry().protocol_version().to_string(),
    })
}

// ============================================================================
// Compute Endpoints
// ============================================================================

async fn list_computes(State(state): State<ApiState>) -> Json<Vec<ComputeHost>> {
    Json(state.controller.list_computes())
}

async fn add_compute(
    State(state): State<ApiState>,
    Json(descriptor): Json<ComputeDescriptor>,
) -> ApiResult<(StatusCode, Json<ComputeHost>)> {
    let host = state.controller.add_compute(descriptor).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

async fn get_compute(
    State(state): State<ApiState>,
    Path(compute_id): Path<String>,
) -> ApiResult<Json<ComputeHost>> {
    Ok(Json(state.controller.get_compute(&compute_id)?))
}

#[derive(Debug, Default, Deserialize)]
struct RemoveQuery {
    #[serde(default)]
    force: bool,
}

async fn remove_compute(
    State(state): State<ApiState>,
    Path(compute_id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<StatusCode> {
    state
        .controller
        .remove_compute(&compute_id, query.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn probe_compute(
    State(state): State<ApiState>,
    Path(compute_id): Path<String>,
) -> ApiResult<Json<ComputeHost>> {
    Ok(Json(state.controller.probe_compute(&compute_id).await?))
}

// ============================================================================
// Project Endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenProjectRequest {
    name: String,
    #[serde(rename = "projectId", default)]
    project_id: Option<Uuid>,
}

async fn list_projects(State(state): State<ApiState>) -> Json<Vec<Project>> {
    Json(state.controller.list_projects())
}

async fn open_project(
    State(state): State<ApiState>,
    Json(request): Json<OpenProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = state
        .controller
        .open_project(request.name, request.project_id)?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Project>> {
    Ok(Json(state.controller.get_project(project_id)?))
}

async fn delete_project(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.controller.delete_project(project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_project(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.controller.close_project(project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_project(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
    Json(snapshot): Json<ProjectSnapshot>,
) -> ApiResult<(StatusCode, Json<ProjectSnapshot>)> {
    if snapshot.project.project_id != project_id {
        return Err(OrchestratorError::InvalidInput(format!(
            "snapshot belongs to project {}",
            snapshot.project.project_id
        ))
        .into());
    }
    let loaded = state.controller.load_project(snapshot).await?;
    Ok((StatusCode::CREATED, Json(loaded)))
}

async fn project_snapshot(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<ProjectSnapshot>> {
    Ok(Json(state.controller.snapshot(project_id).await?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::compute::SimulatedConnector;
    use crate::controller::ControllerConfig;
    use axum::{body::Body, http::Request};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    pub(crate) fn create_test_app() -> (Router, Controller, SimulatedConnector) {
        let connector = SimulatedConnector::new();
        let config = ControllerConfig {
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let controller = Controller::new(Arc::new(connector.clone()), "2.2", config);
        let app = create_router(ApiState::new(controller.clone()));
        (app, controller, connector)
    }

    pub(crate) fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub(crate) fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    pub(crate) async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _, _) = create_test_app();
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_version_reports_protocol() {
        let (app, _, _) = create_test_app();
        let response = app.oneshot(empty_request("GET", "/v2/version")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["protocolVersion"], "2.2");
    }

    #[tokio::test]
    async fn test_add_and_remove_compute() {
        let (app, _, _) = create_test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v2/computes",
                json!({"computeId": "h1", "host": "10.0.0.1", "port": 8001}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "connected");
        assert!(body.get("password").is_none());

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/v2/computes/h1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", "/v2/computes/h1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let (app, _, _) = create_test_app();
        let response = app
            .oneshot(empty_request("GET", &format!("/v2/projects/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["status"], 404);
        assert_eq!(body["kind"], "NotFound");
        assert_eq!(body["class"], "invalid_request");
    }

    #[tokio::test]
    async fn test_open_close_project() {
        let (app, controller, _) = create_test_app();

        let response = app
            .clone()
            .oneshot(json_request("POST", "/v2/projects", json!({"name": "lab"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let project_id = body["projectId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/v2/projects/{}/snapshot", project_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(empty_request("POST", &format!("/v2/projects/{}/close", project_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(controller.list_projects().is_empty());
    }

    #[tokio::test]
    async fn test_load_rejects_foreign_snapshot() {
        let (app, controller, _) = create_test_app();
        let project = controller.open_project("lab", None).unwrap();
        let snapshot = controller.snapshot(project.project_id).await.unwrap();

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/v2/projects/{}/load", Uuid::new_v4()),
                serde_json::to_value(&snapshot).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
