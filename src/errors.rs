//! Typed error hierarchy for the draftflow orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `EngineError` — graph engine and stage execution failures
//! - `SchedulerError` — review chain failures
//! - `StoreError` — checkpoint persistence failures
//! - `DispatchError` — notification channel failures

use thiserror::Error;
use uuid::Uuid;

/// Errors from the pipeline graph engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Run {id} not found")]
    RunNotFound { id: Uuid },

    #[error("Run {id} is {status}; cancel is only valid while running")]
    CancelConflict { id: Uuid, status: String },

    #[error("Stage {stage} references unknown capability {capability}")]
    UnknownCapability { stage: String, capability: String },

    #[error("Review config must name between 1 and {max} reviewers, got {got}")]
    InvalidReviewerCount { max: usize, got: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the review assignment scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Assignment {id} not found")]
    AssignmentNotFound { id: Uuid },

    #[error("Assignment {id} is {status}; decisions are only valid on pending or held assignments")]
    DecisionConflict { id: Uuid, status: String },

    #[error("Revise decision requires a target stage")]
    MissingTargetStage,

    #[error("Revise target {stage} is not part of the run's definition")]
    UnknownTargetStage { stage: String },

    #[error("Review config must name between 1 and {max} reviewers, got {got}")]
    InvalidReviewerCount { max: usize, got: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Version conflict on run {id}: expected {expected}, stored {stored}")]
    VersionConflict {
        id: Uuid,
        expected: u64,
        stored: u64,
    },

    #[error("Run {id} not found")]
    RunNotFound { id: Uuid },

    #[error("Assignment {id} not found")]
    AssignmentNotFound { id: Uuid },

    #[error("Assignment {id} was already resolved by a concurrent writer")]
    AssignmentConflict { id: Uuid },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error from a notification channel. `retryable` distinguishes transient
/// delivery failures (retried immediately) from permanent ones.
#[derive(Debug, Error)]
#[error("Delivery to {recipient} failed: {message}")]
pub struct DispatchError {
    pub recipient: String,
    pub message: String,
    pub retryable: bool,
}
