use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::PipelineDefinition;

/// Run-level lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingReview,
    RevisionRequested,
    Rejected,
    Complete,
    Escalated,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingReview => "awaiting_review",
            Self::RevisionRequested => "revision_requested",
            Self::Rejected => "rejected",
            Self::Complete => "complete",
            Self::Escalated => "escalated",
        }
    }

    /// Terminal statuses end automatic processing; the run is archived, not deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Complete | Self::Escalated)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "awaiting_review" => Ok(Self::AwaitingReview),
            "revision_requested" => Ok(Self::RevisionRequested),
            "rejected" => Ok(Self::Rejected),
            "complete" => Ok(Self::Complete),
            "escalated" => Ok(Self::Escalated),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-stage execution state recorded on the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    /// Success payload returned by the capability. Opaque to the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Invocation attempts consumed, including transient-failure retries.
    pub attempts: u32,
}

/// Severity of a single quality finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One finding reported by a quality check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

/// Result of a gated stage's quality check. Consumed once by the gate
/// router; retained in the run's gate history for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScore {
    /// Stage whose gate produced this score.
    pub stage_id: String,
    pub pass: bool,
    pub findings: Vec<Finding>,
}

impl QualityScore {
    pub fn passing(stage_id: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            pass: true,
            findings: Vec::new(),
        }
    }

    pub fn failing(stage_id: &str, findings: Vec<Finding>) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            pass: false,
            findings,
        }
    }
}

/// Audit entry for one gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub stage_id: String,
    pub pass: bool,
    /// Retry counter value for this gate after the evaluation.
    pub retry_count: u32,
    pub findings: Vec<Finding>,
    pub decided_at: DateTime<Utc>,
}

/// Per-run review configuration. Set at submission, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Ordered reviewer identifiers; position decides activation order.
    pub reviewers: Vec<String>,
    /// SLA for each reviewer before the scheduler intervenes.
    #[serde(default = "default_sla_hours")]
    pub sla_hours: i64,
    /// How long before the deadline a reminder is sent.
    #[serde(default = "default_reminder_lead_hours")]
    pub reminder_lead_hours: i64,
    /// Administrator contact for timeout and escalation notices.
    pub admin_contact: String,
}

fn default_sla_hours() -> i64 {
    24
}

fn default_reminder_lead_hours() -> i64 {
    4
}

impl ReviewConfig {
    pub fn sla(&self) -> chrono::Duration {
        chrono::Duration::hours(self.sla_hours)
    }

    pub fn reminder_lead(&self) -> chrono::Duration {
        chrono::Duration::hours(self.reminder_lead_hours)
    }
}

/// The mutable state object for one submission.
///
/// Mutated only by the graph engine and the review scheduler; every
/// mutation is committed through the checkpoint store, guarded by the
/// `version` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    /// Snapshot of the definition at submission time. Later edits to the
    /// definition never affect an in-flight run.
    pub definition: PipelineDefinition,
    pub stages: HashMap<String, StageRecord>,
    /// Retry counters scoped per gate stage id, so independent gates
    /// retry independently.
    pub gate_retries: HashMap<String, u32>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    pub gate_history: Vec<GateVerdict>,
    pub review: ReviewConfig,
    /// Initial client inputs, fed to stages with no dependencies.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Monotonically increasing version for optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(
        definition: PipelineDefinition,
        inputs: HashMap<String, serde_json::Value>,
        review: ReviewConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let stages = definition
            .stages
            .iter()
            .map(|s| (s.id.clone(), StageRecord::default()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            definition,
            stages,
            gate_retries: HashMap::new(),
            status: RunStatus::Running,
            escalation_reason: None,
            gate_history: Vec::new(),
            review,
            inputs,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage(&self, id: &str) -> Option<&StageRecord> {
        self.stages.get(id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut StageRecord> {
        self.stages.get_mut(id)
    }

    /// Retry counter for a gate, zero if never failed.
    pub fn gate_retry_count(&self, stage_id: &str) -> u32 {
        self.gate_retries.get(stage_id).copied().unwrap_or(0)
    }

    /// All stages have reached a successful terminal state.
    pub fn all_stages_completed(&self) -> bool {
        self.stages
            .values()
            .all(|r| r.status == StageStatus::Completed)
    }

    pub fn mark_escalated(&mut self, reason: &str) {
        self.status = RunStatus::Escalated;
        self.escalation_reason = Some(reason.to_string());
    }
}

/// Status of one reviewer's slot in a run's approval chain.
///
/// `Queued` covers assignments created up-front but not yet activated,
/// preserving the invariant that exactly one assignment per run is
/// `Pending` or `Held` at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Queued,
    Pending,
    Approved,
    AutoApproved,
    Rejected,
    RevisionRequested,
    Held,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::AutoApproved => "auto_approved",
            Self::Rejected => "rejected",
            Self::RevisionRequested => "revision_requested",
            Self::Held => "held",
        }
    }

    /// Active assignments are the ones a human decision can still resolve.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Held)
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "auto_approved" => Ok(Self::AutoApproved),
            "rejected" => Ok(Self::Rejected),
            "revision_requested" => Ok(Self::RevisionRequested),
            "held" => Ok(Self::Held),
            _ => Err(format!("Invalid assignment status: {}", s)),
        }
    }
}

/// Action a reviewer selects when resolving an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    Revise,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Revise => "revise",
        }
    }
}

impl std::fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "revise" => Ok(Self::Revise),
            _ => Err(format!("Invalid review action: {}", s)),
        }
    }
}

/// One reviewer's slot within a run's approval chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAssignment {
    pub id: Uuid,
    pub run_id: Uuid,
    pub reviewer: String,
    /// Position in the chain, 1..N, unique and contiguous per run.
    pub ord: u32,
    pub is_final: bool,
    pub status: AssignmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ReviewAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Rework target recorded with a revise decision, kept on the row so a
    /// revision interrupted before the run transition can be replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<String>,
    /// Set once the pre-deadline reminder has gone out.
    pub reminded: bool,
    /// Last time a hold notice was emitted; drives the repeat interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl ReviewAssignment {
    pub fn queued(run_id: Uuid, reviewer: &str, ord: u32, is_final: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            reviewer: reviewer.to_string(),
            ord,
            is_final,
            status: AssignmentStatus::Queued,
            assigned_at: None,
            deadline: None,
            completed_at: None,
            action: None,
            note: None,
            target_stage: None,
            reminded: false,
            last_notified_at: None,
        }
    }

    /// Activate this slot: it becomes the run's single pending assignment.
    pub fn activate(&mut self, now: DateTime<Utc>, sla: chrono::Duration) {
        self.status = AssignmentStatus::Pending;
        self.assigned_at = Some(now);
        self.deadline = Some(now + sla);
        self.reminded = false;
    }
}

/// Kinds of messages the dispatcher can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Assignment,
    Reminder,
    AutoApproveNotice,
    HoldNotice,
    Timeout,
    Escalation,
    DegradedDelivery,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assignment => "assignment",
            Self::Reminder => "reminder",
            Self::AutoApproveNotice => "auto_approve_notice",
            Self::HoldNotice => "hold_notice",
            Self::Timeout => "timeout",
            Self::Escalation => "escalation",
            Self::DegradedDelivery => "degraded_delivery",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assignment" => Ok(Self::Assignment),
            "reminder" => Ok(Self::Reminder),
            "auto_approve_notice" => Ok(Self::AutoApproveNotice),
            "hold_notice" => Ok(Self::HoldNotice),
            "timeout" => Ok(Self::Timeout),
            "escalation" => Ok(Self::Escalation),
            "degraded_delivery" => Ok(Self::DegradedDelivery),
            _ => Err(format!("Invalid notification kind: {}", s)),
        }
    }
}

/// Audit entry for one attempted message delivery. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub channel: String,
    pub recipient: String,
    pub success: bool,
    pub attempt: u32,
    pub sent_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
