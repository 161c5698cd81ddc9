//! Notification delivery over HTTP
//!
//! Project streams open with the project snapshot, followed by events in
//! sequence order. `?resumeFrom=N` asks for everything after N; discarded
//! events show up as one `events.missed` item.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{ApiResult, ApiState};
use crate::error::OrchestratorError;
use crate::notification::{StreamItem, Subscription};
use crate::topology::ProjectSnapshot;

#[derive(Debug, Default, Deserialize)]
pub(super) struct StreamQuery {
    #[serde(rename = "resumeFrom", default)]
    resume_from: Option<u64>,
}

/// First line of a project stream
#[derive(Serialize)]
struct SnapshotFrame<'a> {
    kind: &'static str,
    snapshot: &'a ProjectSnapshot,
}

fn snapshot_line(snapshot: &ProjectSnapshot) -> String {
    serde_json::to_string(&SnapshotFrame {
        kind: "project.snapshot",
        snapshot,
    })
    .unwrap_or_default()
}

fn item_line(item: &StreamItem) -> String {
    serde_json::to_string(item).unwrap_or_default()
}

fn ndjson(head: Option<String>, subscription: Subscription) -> Response {
    let lines = stream::iter(head)
        .chain(subscription.into_stream().map(|item| item_line(&item)))
        .map(|line| Ok::<_, Infallible>(format!("{}\n", line)));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn pump(mut socket: WebSocket, head: Option<String>, mut subscription: Subscription) {
    if let Some(head) = head {
        if socket.send(Message::Text(head.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            item = subscription.next() => match item {
                Some(item) => {
                    if socket.send(Message::Text(item_line(&item).into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Notification websocket closed");
}

// ============================================================================
// Project streams
// ============================================================================

pub(super) async fn project_stream(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let (snapshot, subscription) = state
        .controller
        .subscribe(project_id, query.resume_from)
        .await?;
    Ok(ndjson(Some(snapshot_line(&snapshot)), subscription))
}

pub(super) async fn project_websocket(
    State(state): State<ApiState>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let (snapshot, subscription) = state
        .controller
        .subscribe(project_id, query.resume_from)
        .await?;
    let head = snapshot_line(&snapshot);
    Ok(ws.on_upgrade(move |socket| pump(socket, Some(head), subscription)))
}

// ============================================================================
// Controller stream
// ============================================================================

fn controller_subscription(state: &ApiState, resume_from: Option<u64>) -> ApiResult<Subscription> {
    state
        .controller
        .subscribe_controller(resume_from)
        .ok_or_else(|| OrchestratorError::Internal("controller stream closed".to_string()).into())
}

pub(super) async fn controller_stream(
    State(state): State<ApiState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let subscription = controller_subscription(&state, query.resume_from)?;
    Ok(ndjson(None, subscription))
}

pub(super) async fn controller_websocket(
    State(state): State<ApiState>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let subscription = controller_subscription(&state, query.resume_from)?;
    Ok(ws.on_upgrade(move |socket| pump(socket, None, subscription)))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{create_test_app, empty_request};
    use super::*;
    use crate::topology::DrawingUpdate;
    use tower::ServiceExt;

    async fn read_lines(response: Response) -> Vec<serde_json::Value> {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_project_stream_starts_with_snapshot() {
        let (app, controller, _) = create_test_app();
        let project_id = controller.open_project("lab", None).unwrap().project_id;

        let response = app
            .oneshot(empty_request(
                "GET",
                &format!("/v2/projects/{}/notifications", project_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let drawing = controller
            .create_drawing(
                project_id,
                serde_json::from_value(serde_json::json!({"svg": "<svg/>"})).unwrap(),
            )
            .await
            .unwrap();
        controller
            .update_drawing(
                project_id,
                drawing.drawing_id,
                DrawingUpdate {
                    x: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        controller.close_project(project_id).await.unwrap();

        let lines = read_lines(response).await;
        assert_eq!(lines[0]["kind"], "project.snapshot");
        assert_eq!(lines[0]["snapshot"]["sequence"], 0);
        let kinds: Vec<&str> = lines[1..]
            .iter()
            .map(|l| l["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["drawing.created", "drawing.updated", "project.closed"]);
        let sequences: Vec<u64> = lines[1..]
            .iter()
            .map(|l| l["sequence"].as_u64().unwrap())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_of_unknown_project() {
        let (app, _, _) = create_test_app();
        let response = app
            .oneshot(empty_request(
                "GET",
                &format!("/v2/projects/{}/notifications", Uuid::new_v4()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
