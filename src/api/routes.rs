//! Route handlers and the error-to-status mapping.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::definition::PipelineDefinition;
use crate::errors::{EngineError, SchedulerError, StoreError};
use crate::graph::PipelineEngine;
use crate::model::{
    GateVerdict, NotificationRecord, PipelineRun, ReviewAction, ReviewAssignment, ReviewConfig,
    RunStatus, StageRecord,
};
use crate::review::{DecisionOutcome, ReviewScheduler};
use crate::store::StoreHandle;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PipelineEngine>,
    pub scheduler: Arc<ReviewScheduler>,
    pub store: StoreHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(create_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/notifications", get(get_notifications))
        .route("/assignments/{id}/decision", post(submit_decision))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API error with an HTTP status. Internal detail is logged, not leaked.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Internal(e) => {
                error!("internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RunNotFound { .. } | StoreError::AssignmentNotFound { .. } => {
                Self::NotFound(e.to_string())
            }
            StoreError::VersionConflict { .. } | StoreError::AssignmentConflict { .. } => {
                Self::Conflict(e.to_string())
            }
            StoreError::Database(inner) | StoreError::Other(inner) => Self::Internal(inner),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::RunNotFound { .. } => Self::NotFound(e.to_string()),
            EngineError::CancelConflict { .. } => Self::Conflict(e.to_string()),
            EngineError::UnknownCapability { .. } | EngineError::InvalidReviewerCount { .. } => {
                Self::BadRequest(e.to_string())
            }
            EngineError::Store(inner) => inner.into(),
            EngineError::Other(inner) => Self::Internal(inner),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::AssignmentNotFound { .. } => Self::NotFound(e.to_string()),
            SchedulerError::DecisionConflict { .. } => Self::Conflict(e.to_string()),
            SchedulerError::MissingTargetStage
            | SchedulerError::UnknownTargetStage { .. }
            | SchedulerError::InvalidReviewerCount { .. } => Self::BadRequest(e.to_string()),
            SchedulerError::Store(inner) => inner.into(),
            SchedulerError::Engine(inner) => inner.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub definition: PipelineDefinition,
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    pub review: ReviewConfig,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub action: ReviewAction,
    #[serde(default)]
    pub target_stage: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunView {
    pub id: Uuid,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    pub stages: HashMap<String, StageRecord>,
    pub gate_history: Vec<GateVerdict>,
    pub assignments: Vec<ReviewAssignment>,
    pub version: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl RunView {
    fn new(run: PipelineRun, assignments: Vec<ReviewAssignment>) -> Self {
        Self {
            id: run.id,
            status: run.status,
            escalation_reason: run.escalation_reason,
            stages: run.stages,
            gate_history: run.gate_history,
            assignments,
            version: run.version,
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DecisionView {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<String>,
    pub run: RunView,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunView>), ApiError> {
    let run = state
        .engine
        .submit(req.definition, req.inputs, req.review)
        .await?;
    let view = load_view(&state, run).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunView>, ApiError> {
    let run = state.engine.status(id).await?;
    let view = load_view(&state, run).await?;
    Ok(Json(view))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunView>, ApiError> {
    let run = state.engine.cancel(id).await?;
    let view = load_view(&state, run).await?;
    Ok(Json(view))
}

async fn get_notifications(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<NotificationRecord>>, ApiError> {
    // 404 for unknown runs rather than an empty ledger.
    state.engine.status(id).await?;
    let records = state.store.call(move |s| s.load_notifications(id)).await?;
    Ok(Json(records))
}

async fn submit_decision(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<DecisionView>, ApiError> {
    let assignment = state.store.call(move |s| s.load_assignment(id)).await?;
    let run_id = assignment.run_id;

    let outcome = state
        .scheduler
        .submit_decision(id, req.action, req.target_stage, req.note)
        .await?;

    // A revision hands the run back to the engine; the reworked stages run
    // before this request returns.
    let (outcome_str, target_stage) = match outcome {
        DecisionOutcome::Advanced { .. } => ("advanced", None),
        DecisionOutcome::RunCompleted => ("run_completed", None),
        DecisionOutcome::RunRejected => ("run_rejected", None),
        DecisionOutcome::RevisionRequested { target_stage } => {
            state.engine.advance(run_id).await?;
            ("revision_requested", Some(target_stage))
        }
    };

    let run = state.engine.status(run_id).await?;
    let view = load_view(&state, run).await?;
    Ok(Json(DecisionView {
        outcome: outcome_str,
        target_stage,
        run: view,
    }))
}

async fn load_view(state: &AppState, run: PipelineRun) -> Result<RunView, ApiError> {
    let run_id = run.id;
    let assignments = state
        .store
        .call(move |s| s.load_assignments(run_id))
        .await?;
    Ok(RunView::new(run, assignments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityRegistry;
    use crate::capability::testing::{FakeCheck, FakeStage};
    use crate::definition::StageDef;
    use crate::graph::EngineConfig;
    use crate::model::AssignmentStatus;
    use crate::notify::Dispatcher;
    use crate::notify::testing::FakeChannel;
    use crate::review::{Clock, SystemClock};
    use crate::store::CheckpointStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(registry: CapabilityRegistry) -> Router {
        let store = StoreHandle::new(CheckpointStore::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(FakeChannel::reliable()),
            store.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(ReviewScheduler::new(
            store.clone(),
            dispatcher.clone(),
            clock.clone(),
            "https://review.example",
        ));
        let engine = Arc::new(PipelineEngine::new(
            store.clone(),
            registry,
            scheduler.clone(),
            dispatcher,
            clock,
            EngineConfig {
                max_stage_attempts: 3,
                retry_backoff: std::time::Duration::from_millis(0),
            },
            "https://review.example",
        ));
        build_router(AppState {
            engine,
            scheduler,
            store,
        })
    }

    fn writer_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register_stage(
            "writer",
            Arc::new(FakeStage::ok(serde_json::json!("draft text"))),
        );
        registry.register_check("style_check", Arc::new(FakeCheck::passing()));
        registry
    }

    fn create_body() -> serde_json::Value {
        serde_json::json!({
            "definition": {
                "stages": [
                    { "id": "draft", "capability": "writer", "depends_on": [] }
                ]
            },
            "inputs": { "topic": "release notes" },
            "review": {
                "reviewers": ["alice", "bob"],
                "admin_contact": "admin"
            }
        })
    }

    async fn request(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let request = match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let app = app(writer_registry());

        let (status, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "awaiting_review");
        assert_eq!(body["stages"]["draft"]["status"], "completed");
        assert_eq!(body["assignments"][0]["reviewer"], "alice");
        assert_eq!(body["assignments"][0]["status"], "pending");

        let id = body["id"].as_str().unwrap().to_string();
        let (status, fetched) = request(&app, "GET", &format!("/runs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], body["id"]);
    }

    #[tokio::test]
    async fn test_get_unknown_run_is_404() {
        let app = app(writer_registry());
        let (status, body) =
            request(&app, "GET", &format!("/runs/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_create_run_with_unknown_capability_is_400() {
        let app = app(CapabilityRegistry::new());
        let (status, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("writer"));
    }

    #[tokio::test]
    async fn test_cancel_after_review_conflicts() {
        let app = app(writer_registry());
        let (_, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        let id = body["id"].as_str().unwrap().to_string();

        // The run already reached review, so cancellation is refused.
        let (status, body) =
            request(&app, "POST", &format!("/runs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("awaiting_review"));
    }

    #[tokio::test]
    async fn test_approval_chain_over_http() {
        let app = app(writer_registry());
        let (_, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        let first = body["assignments"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = request(
            &app,
            "POST",
            &format!("/assignments/{}/decision", first),
            Some(serde_json::json!({ "action": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "advanced");
        assert_eq!(body["run"]["status"], "awaiting_review");
        assert_eq!(body["run"]["assignments"][1]["status"], "pending");

        let second = body["run"]["assignments"][1]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let (status, body) = request(
            &app,
            "POST",
            &format!("/assignments/{}/decision", second),
            Some(serde_json::json!({ "action": "approve", "note": "ship it" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "run_completed");
        assert_eq!(body["run"]["status"], "complete");
    }

    #[tokio::test]
    async fn test_revision_reruns_pipeline_before_responding() {
        let app = app(writer_registry());
        let (_, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        let first = body["assignments"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = request(
            &app,
            "POST",
            &format!("/assignments/{}/decision", first),
            Some(serde_json::json!({
                "action": "revise",
                "target_stage": "draft",
                "note": "tighten the intro"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "revision_requested");
        assert_eq!(body["target_stage"], "draft");
        // The rework ran and the chain restarted before the response.
        assert_eq!(body["run"]["status"], "awaiting_review");
        assert_eq!(body["run"]["stages"]["draft"]["status"], "completed");
        assert_eq!(body["run"]["assignments"][0]["status"], "pending");
    }

    #[tokio::test]
    async fn test_double_decision_conflicts() {
        let app = app(writer_registry());
        let (_, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        let first = body["assignments"][0]["id"].as_str().unwrap().to_string();

        let approve = serde_json::json!({ "action": "approve" });
        request(
            &app,
            "POST",
            &format!("/assignments/{}/decision", first),
            Some(approve.clone()),
        )
        .await;
        let (status, _) = request(
            &app,
            "POST",
            &format!("/assignments/{}/decision", first),
            Some(approve),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_revise_without_target_is_400() {
        let app = app(writer_registry());
        let (_, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        let first = body["assignments"][0]["id"].as_str().unwrap().to_string();

        let (status, _) = request(
            &app,
            "POST",
            &format!("/assignments/{}/decision", first),
            Some(serde_json::json!({ "action": "revise" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_notifications_ledger_exposed() {
        let app = app(writer_registry());
        let (_, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        let id = body["id"].as_str().unwrap().to_string();

        let (status, records) =
            request(&app, "GET", &format!("/runs/{}/notifications", id), None).await;
        assert_eq!(status, StatusCode::OK);
        // At least the first reviewer's assignment notice.
        assert!(!records.as_array().unwrap().is_empty());
        assert_eq!(records[0]["kind"], "assignment");
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(writer_registry());
        let (status, body) = request(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_assignments_ordered_and_flagged() {
        let app = app(writer_registry());
        let (_, body) = request(&app, "POST", "/runs", Some(create_body())).await;
        let assignments = body["assignments"].as_array().unwrap();
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0]["ord"], 1);
        assert_eq!(assignments[1]["ord"], 2);
        assert_eq!(assignments[0]["is_final"], false);
        assert_eq!(assignments[1]["is_final"], true);
        assert_eq!(
            assignments[1]["status"],
            serde_json::json!(AssignmentStatus::Queued)
        );
    }
}
