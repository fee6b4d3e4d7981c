//! Quality gate router.
//!
//! Interprets the pass/fail score a gated stage's quality check produced and
//! decides whether the run advances, retries the producing stage, or
//! escalates to a human. Decisions are an exhaustively matched tagged union
//! rather than a string-keyed routing map, so a misconfigured gate cannot
//! silently fall through to a default route.

use serde::{Deserialize, Serialize};

use crate::definition::GateSpec;
use crate::model::QualityScore;

/// Why automatic processing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// A gate's retry budget ran out without a passing score.
    QualityGateExhausted,
    /// A stage kept failing at the transport/processing level.
    StageFailure,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QualityGateExhausted => "quality_gate_exhausted",
            Self::StageFailure => "stage_failure",
        }
    }
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Score passed: continue along the stage's configured transition.
    Advance,
    /// Score failed within budget: re-run the stage that produced the
    /// gated content (which may be upstream of the gate itself).
    Retry { target_stage: String },
    /// Retry budget exhausted: stop automatic processing.
    Escalate { reason: EscalationReason },
}

/// Evaluate a gate verdict.
///
/// `prior_failures` is the gate's retry counter before this evaluation,
/// scoped per gate id so independent gates retry independently. On a
/// failing score the counter advances to `prior_failures + 1`; the decision
/// is `Retry` while that stays within `max_retries` and `Escalate` on the
/// (bound + 1)-th failure.
pub fn evaluate(gate: &GateSpec, prior_failures: u32, score: &QualityScore) -> GateDecision {
    if score.pass {
        return GateDecision::Advance;
    }

    let failures = prior_failures + 1;
    if failures <= gate.max_retries {
        GateDecision::Retry {
            target_stage: gate.rework_stage.clone(),
        }
    } else {
        GateDecision::Escalate {
            reason: EscalationReason::QualityGateExhausted,
        }
    }
}
