//! Node, link, capture and drawing endpoints of a project

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{optional_body, ApiResult, ApiState};
use crate::controller::LinkOutcome;
use crate::error::OrchestratorError;
use crate::topology::{
    CaptureSession, Drawing, DrawingUpdate, Link, LinkUpdate, Node, NodeRequest, NodeUpdate,
    PortRef,
};

type NodePath = Path<(Uuid, Uuid)>;

// ============================================================================
// Nodes
// ============================================================================

pub(super) async fn list_nodes(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(state.controller.list_nodes(project_id).await?))
}

pub(super) async fn create_node(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<NodeRequest>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let node = state.controller.create_node(project_id, request).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

pub(super) async fn get_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.controller.get_node(project_id, node_id).await?))
}

pub(super) async fn update_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
    Json(update): Json<NodeUpdate>,
) -> ApiResult<Json<Node>> {
    Ok(Json(
        state
            .controller
            .update_node(project_id, node_id, update)
            .await?,
    ))
}

pub(super) async fn delete_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<StatusCode> {
    state.controller.delete_node(project_id, node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn start_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.controller.start_node(project_id, node_id).await?))
}

pub(super) async fn stop_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.controller.stop_node(project_id, node_id).await?))
}

pub(super) async fn suspend_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.controller.suspend_node(project_id, node_id).await?))
}

pub(super) async fn resume_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.controller.resume_node(project_id, node_id).await?))
}

pub(super) async fn reload_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.controller.reload_node(project_id, node_id).await?))
}

pub(super) async fn reconcile_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<Json<Node>> {
    Ok(Json(
        state.controller.reconcile_node(project_id, node_id).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
struct DuplicateRequest {
    #[serde(default)]
    name: Option<String>,
}

pub(super) async fn duplicate_node(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let request: DuplicateRequest = optional_body(&body)?;
    let node = state
        .controller
        .duplicate_node(project_id, node_id, request.name)
        .await?;
    Ok((StatusCode::CREATED, Json(node)))
}

#[derive(Serialize)]
pub(super) struct IdlePcResponse {
    #[serde(rename = "idlepc")]
    idle_pc: String,
}

pub(super) async fn auto_idle_pc(
    State(state): State<ApiState>,
    Path((project_id, node_id)): NodePath,
) -> ApiResult<Json<IdlePcResponse>> {
    let idle_pc = state.controller.auto_idle_pc(project_id, node_id).await?;
    Ok(Json(IdlePcResponse { idle_pc }))
}

// ============================================================================
// Captures
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct CaptureRequest {
    #[serde(default)]
    sink: Option<String>,
    #[serde(rename = "linkType", default)]
    link_type: Option<String>,
}

pub(super) async fn start_port_capture(
    State(state): State<ApiState>,
    Path((project_id, node_id, adapter, port)): Path<(Uuid, Uuid, u32, u32)>,
    body: Bytes,
) -> ApiResult<Json<CaptureSession>> {
    let request: CaptureRequest = optional_body(&body)?;
    let session = state
        .controller
        .start_capture(
            project_id,
            PortRef::new(node_id, adapter, port),
            request.sink,
            request.link_type,
        )
        .await?;
    Ok(Json(session))
}

pub(super) async fn stop_port_capture(
    State(state): State<ApiState>,
    Path((project_id, node_id, adapter, port)): Path<(Uuid, Uuid, u32, u32)>,
) -> ApiResult<StatusCode> {
    state
        .controller
        .stop_capture(project_id, PortRef::new(node_id, adapter, port))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn start_link_capture(
    State(state): State<ApiState>,
    Path((project_id, link_id)): Path<(Uuid, Uuid)>,
    body: Bytes,
) -> ApiResult<Json<CaptureSession>> {
    let request: CaptureRequest = optional_body(&body)?;
    let session = state
        .controller
        .start_link_capture(project_id, link_id, request.sink, request.link_type)
        .await?;
    Ok(Json(session))
}

pub(super) async fn stop_link_capture(
    State(state): State<ApiState>,
    Path((project_id, link_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state
        .controller
        .stop_link_capture(project_id, link_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Links
// ============================================================================

/// The two ports a new link connects
#[derive(Debug, Deserialize)]
pub(super) struct CreateLinkRequest {
    nodes: Vec<PortRef>,
}

pub(super) async fn list_links(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Link>>> {
    Ok(Json(state.controller.list_links(project_id).await?))
}

pub(super) async fn create_link(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
    Json(request): Json<CreateLinkRequest>,
) -> ApiResult<(StatusCode, Json<Link>)> {
    let [a, b] = <[PortRef; 2]>::try_from(request.nodes).map_err(|nodes| {
        OrchestratorError::InvalidInput(format!(
            "a link connects exactly 2 ports, {} given",
            nodes.len()
        ))
    })?;
    let link = state.controller.create_link(project_id, a, b).await?;
    Ok((StatusCode::CREATED, Json(link)))
}

pub(super) async fn get_link(
    State(state): State<ApiState>,
    Path((project_id, link_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Link>> {
    Ok(Json(state.controller.get_link(project_id, link_id).await?))
}

pub(super) async fn update_link(
    State(state): State<ApiState>,
    Path((project_id, link_id)): Path<(Uuid, Uuid)>,
    Json(update): Json<LinkUpdate>,
) -> ApiResult<Json<Link>> {
    Ok(Json(
        state
            .controller
            .update_link(project_id, link_id, update)
            .await?,
    ))
}

pub(super) async fn delete_link(
    State(state): State<ApiState>,
    Path((project_id, link_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.controller.delete_link(project_id, link_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn establish_link(
    State(state): State<ApiState>,
    Path((project_id, link_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Link>> {
    Ok(Json(
        state.controller.establish_link(project_id, link_id).await?,
    ))
}

pub(super) async fn establish_links(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<LinkOutcome>>> {
    Ok(Json(state.controller.establish_links(project_id).await?))
}

// ============================================================================
// Drawings
// ============================================================================

pub(super) async fn list_drawings(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Drawing>>> {
    Ok(Json(state.controller.list_drawings(project_id).await?))
}

pub(super) async fn create_drawing(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
    Json(drawing): Json<Drawing>,
) -> ApiResult<(StatusCode, Json<Drawing>)> {
    let drawing = state.controller.create_drawing(project_id, drawing).await?;
    Ok((StatusCode::CREATED, Json(drawing)))
}

pub(super) async fn update_drawing(
    State(state): State<ApiState>,
    Path((project_id, drawing_id)): Path<(Uuid, Uuid)>,
    Json(update): Json<DrawingUpdate>,
) -> ApiResult<Json<Drawing>> {
    Ok(Json(
        state
            .controller
            .update_drawing(project_id, drawing_id, update)
            .await?,
    ))
}

pub(super) async fn delete_drawing(
    State(state): State<ApiState>,
    Path((project_id, drawing_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state
        .controller
        .delete_drawing(project_id, drawing_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
