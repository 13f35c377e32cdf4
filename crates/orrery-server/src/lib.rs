//! HTTP surface exposing the pipeline engine as a service.
//!
//! ```text
//! POST /pipelines                          submit DOT source, start a run
//! GET  /pipelines/{id}                     run status + result
//! GET  /pipelines/{id}/events              event stream (SSE)
//! POST /pipelines/{id}/cancel              cancel a running pipeline
//! GET  /pipelines/{id}/context             node outcomes map
//! GET  /pipelines/{id}/checkpoint          latest checkpoint JSON
//! GET  /pipelines/{id}/questions           pending human-gate questions
//! POST /pipelines/{id}/questions/{qid}/answer
//! ```

mod runs;

pub use runs::{HttpInterviewer, PendingQuestion, RunHandle, RunRegistry, RunStatus, RunSummary};

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use orrery_pipeline::{load_pipeline, validate_or_raise, Answer};
use orrery_types::Checkpoint;

pub fn router(registry: RunRegistry) -> Router {
    Router::new()
        .route("/pipelines", post(create_pipeline))
        .route("/pipelines/{id}", get(get_pipeline))
        .route("/pipelines/{id}/events", get(get_events))
        .route("/pipelines/{id}/cancel", post(cancel_pipeline))
        .route("/pipelines/{id}/context", get(get_context))
        .route("/pipelines/{id}/checkpoint", get(get_checkpoint))
        .route("/pipelines/{id}/questions", get(get_questions))
        .route(
            "/pipelines/{id}/questions/{qid}/answer",
            post(answer_question),
        )
        .with_state(registry)
}

/// Serve until the process is stopped.
pub async fn serve(addr: &str, registry: RunRegistry) -> orrery_types::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "pipeline server listening");
    axum::serve(listener, router(registry))
        .await
        .map_err(|e| orrery_types::OrreryError::Other(format!("server error: {e}")))
}

#[derive(Deserialize)]
struct CreateRequest {
    dot_source: String,
}

async fn create_pipeline(
    State(registry): State<RunRegistry>,
    Json(body): Json<CreateRequest>,
) -> Response {
    let graph = match load_pipeline(&body.dot_source) {
        Ok(graph) => graph,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("parse error: {err}")})),
            )
                .into_response()
        }
    };
    if let Err(err) = validate_or_raise(&graph) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("validation error: {err}")})),
        )
            .into_response();
    }

    let run = registry.spawn(graph);
    (
        StatusCode::CREATED,
        Json(serde_json::json!({"id": run.id})),
    )
        .into_response()
}

fn lookup(registry: &RunRegistry, id: &str) -> Result<Arc<RunHandle>, Response> {
    registry.get(id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "pipeline not found"})),
        )
            .into_response()
    })
}

async fn get_pipeline(
    State(registry): State<RunRegistry>,
    Path(id): Path<String>,
) -> Response {
    let run = match lookup(&registry, &id) {
        Ok(run) => run,
        Err(resp) => return resp,
    };
    Json(serde_json::json!({
        "id": run.id,
        "status": run.status(),
        "result": run.result(),
        "error": run.error(),
    }))
    .into_response()
}

async fn get_events(State(registry): State<RunRegistry>, Path(id): Path<String>) -> Response {
    let run = match lookup(&registry, &id) {
        Ok(run) => run,
        Err(resp) => return resp,
    };
    let mut body = String::new();
    for event in run.events_snapshot() {
        if let Ok(json) = serde_json::to_string(&event) {
            body.push_str("data: ");
            body.push_str(&json);
            body.push_str("\n\n");
        }
    }
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

async fn cancel_pipeline(
    State(registry): State<RunRegistry>,
    Path(id): Path<String>,
) -> Response {
    let run = match lookup(&registry, &id) {
        Ok(run) => run,
        Err(resp) => return resp,
    };
    run.cancel();
    StatusCode::OK.into_response()
}

async fn get_context(State(registry): State<RunRegistry>, Path(id): Path<String>) -> Response {
    let run = match lookup(&registry, &id) {
        Ok(run) => run,
        Err(resp) => return resp,
    };
    Json(run.outcomes_snapshot()).into_response()
}

async fn get_checkpoint(
    State(registry): State<RunRegistry>,
    Path(id): Path<String>,
) -> Response {
    let run = match lookup(&registry, &id) {
        Ok(run) => run,
        Err(resp) => return resp,
    };
    match Checkpoint::load(&run.logs_root.join("checkpoint.json")) {
        Ok(checkpoint) => Json(checkpoint).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no checkpoint yet"})),
        )
            .into_response(),
    }
}

async fn get_questions(
    State(registry): State<RunRegistry>,
    Path(id): Path<String>,
) -> Response {
    let run = match lookup(&registry, &id) {
        Ok(run) => run,
        Err(resp) => return resp,
    };
    Json(run.pending_questions()).into_response()
}

#[derive(Deserialize)]
struct AnswerRequest {
    answer: String,
}

async fn answer_question(
    State(registry): State<RunRegistry>,
    Path((id, qid)): Path<(String, String)>,
    Json(body): Json<AnswerRequest>,
) -> Response {
    let run = match lookup(&registry, &id) {
        Ok(run) => run,
        Err(resp) => return resp,
    };
    if run.answer_question(&qid, Answer::Choice(body.answer)) {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "question not found"})),
        )
            .into_response()
    }
}
