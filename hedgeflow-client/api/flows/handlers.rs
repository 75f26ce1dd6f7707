use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;

use crate::api::AppState;
use crate::connection::manager::RunOutcome;
use crate::flows::request::RunConfig;
use crate::flows::{Edge, Flow, Node};
use crate::state::recovery;

#[derive(Deserialize)]
pub(crate) struct RunFlowRequest {
    #[serde(default)]
    name: String,
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
    start_node: String,
    #[serde(flatten)]
    config: RunConfig,
}

pub(crate) async fn run_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RunFlowRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let flow = Flow {
        id: id.clone(),
        name: body.name,
        description: String::new(),
        nodes: body.nodes,
        edges: body.edges,
    };

    match state
        .manager
        .run_flow(&id, &flow, &body.start_node, &body.config)
        .await
    {
        Ok(RunOutcome::Started { run_id }) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "connecting", "run_id": run_id })),
        )),
        Ok(RunOutcome::AlreadyActive) => {
            Ok((StatusCode::OK, Json(json!({ "status": "already_active" }))))
        }
        Err(e) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

pub(crate) async fn stop_flow(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let status = state.manager.stop(&id).await;
    Json(json!({ "connection": status }))
}

pub(crate) async fn recover_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let outcome = recovery::recover(
        &state.manager,
        state.backend.as_ref(),
        state.retry,
        &id,
    )
    .await
    .map_err(|e| {
        tracing::warn!(flow_id = %id, error = %e, "recovery failed");
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": format!("recovery failed: {e}") })),
        )
    })?;

    let connection = state.manager.status(&id).await;
    Ok(Json(json!({
        "recovery": outcome,
        "connection": connection,
    })))
}

pub(crate) async fn get_state(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let connection = state.manager.status(&id).await;
    let flow_state = state.store.snapshot(&id).await;
    Json(json!({
        "connection": connection,
        "agent_data": flow_state.agent_data,
        "output_data": flow_state.output_data,
    }))
}

pub(crate) async fn stream_state(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.store.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    if update.flow_id != flow_id {
                        continue;
                    }
                    let sse_event_name = update.kind.as_sse_event();
                    let data = serde_json::to_string(&update).unwrap_or_default();
                    yield Ok(Event::default().event(sse_event_name).data(data));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(flow_id = %flow_id, skipped = n, "state SSE subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)))
}
