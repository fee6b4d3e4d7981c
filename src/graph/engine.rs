//! Pipeline graph engine.
//!
//! Drives a run from submission to quiescence: repeatedly plans the ready
//! set, invokes stage capabilities concurrently, routes gate verdicts, and
//! commits every transition through the checkpoint store before acting on
//! it. The engine stops driving a run once it reaches review or a terminal
//! status; the review scheduler owns it from there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capability::{CapabilityRegistry, StageFailure};
use crate::definition::{PipelineDefinition, StageDef};
use crate::errors::EngineError;
use crate::gate::{self, EscalationReason, GateDecision};
use crate::graph::RunPlanner;
use crate::model::{
    GateVerdict, NotificationKind, PipelineRun, ReviewConfig, RunStatus, StageStatus,
};
use crate::notify::{Dispatcher, NotificationContext, review_link};
use crate::review::{Clock, MAX_REVIEWERS, ReviewScheduler};
use crate::store::StoreHandle;

/// Tunables for stage execution.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total invocation attempts per stage per pass, including the first.
    pub max_stage_attempts: u32,
    /// Base pause before a transient retry; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stage_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

pub struct PipelineEngine {
    store: StoreHandle,
    registry: CapabilityRegistry,
    scheduler: Arc<ReviewScheduler>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    review_base_url: String,
}

impl PipelineEngine {
    pub fn new(
        store: StoreHandle,
        registry: CapabilityRegistry,
        scheduler: Arc<ReviewScheduler>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        review_base_url: &str,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            dispatcher,
            clock,
            config,
            review_base_url: review_base_url.to_string(),
        }
    }

    /// Validate and persist a new run, then drive it.
    ///
    /// The definition is snapshotted onto the run, so the caller may mutate
    /// or re-submit its copy freely afterwards.
    pub async fn submit(
        &self,
        definition: PipelineDefinition,
        inputs: HashMap<String, serde_json::Value>,
        review: ReviewConfig,
    ) -> Result<PipelineRun, EngineError> {
        definition.validate()?;
        if review.reviewers.is_empty() || review.reviewers.len() > MAX_REVIEWERS {
            return Err(EngineError::InvalidReviewerCount {
                max: MAX_REVIEWERS,
                got: review.reviewers.len(),
            });
        }
        for stage in &definition.stages {
            if self.registry.stage(&stage.capability).is_none() {
                return Err(EngineError::UnknownCapability {
                    stage: stage.id.clone(),
                    capability: stage.capability.clone(),
                });
            }
            if let Some(gate) = &stage.gate {
                if self.registry.check(&gate.check).is_none() {
                    return Err(EngineError::UnknownCapability {
                        stage: stage.id.clone(),
                        capability: gate.check.clone(),
                    });
                }
            }
        }

        let run = PipelineRun::new(definition, inputs, review, self.clock.now());
        let id = run.id;
        let created = run.clone();
        self.store.call(move |s| s.create_run(&created)).await?;
        info!(run_id = %id, stages = run.stages.len(), "run submitted");

        self.advance(id).await
    }

    /// Load a run's current state.
    pub async fn status(&self, id: Uuid) -> Result<PipelineRun, EngineError> {
        let run = self.store.call(move |s| s.load_run(id)).await?;
        Ok(run)
    }

    /// Client withdrawal. Only valid while the run is still executing;
    /// the run lands in the rejected disposition and is kept for audit.
    pub async fn cancel(&self, id: Uuid) -> Result<PipelineRun, EngineError> {
        let run = self.store.call(move |s| s.load_run(id)).await?;
        if run.status != RunStatus::Running {
            return Err(EngineError::CancelConflict {
                id,
                status: run.status.to_string(),
            });
        }
        // The status check repeats inside the guarded write: a run that
        // escalated between the read above and this write must not have its
        // terminal disposition replaced.
        let run = self
            .store
            .update_run_if_running(id, self.clock.now(), |run| {
                run.status = RunStatus::Rejected;
                Ok(())
            })
            .await?;
        if run.status != RunStatus::Rejected {
            return Err(EngineError::CancelConflict {
                id,
                status: run.status.to_string(),
            });
        }
        info!(run_id = %id, "run cancelled");
        Ok(run)
    }

    /// Drive a run until no stage is ready: every transition loads fresh
    /// state, mutates, and commits under the optimistic guard, so a crash
    /// mid-pass is recovered by simply calling `advance` again.
    pub async fn advance(&self, id: Uuid) -> Result<PipelineRun, EngineError> {
        let current = self.store.call(move |s| s.load_run(id)).await?;
        if current.status != RunStatus::Running && current.status != RunStatus::RevisionRequested {
            return Ok(current);
        }

        // A stage left in `running` marks a pass that died mid-flight;
        // its invocation never committed, so it is safe to re-plan. The
        // status check repeats inside the closure because a conflict retry
        // reloads state that may have settled in the meantime.
        self.store
            .update_run(id, self.clock.now(), |run| {
                if run.status == RunStatus::RevisionRequested {
                    run.status = RunStatus::Running;
                }
                if run.status == RunStatus::Running {
                    for record in run.stages.values_mut() {
                        if record.status == StageStatus::Running {
                            record.status = StageStatus::Pending;
                        }
                    }
                }
                Ok(())
            })
            .await?;

        loop {
            let run = self.store.call(move |s| s.load_run(id)).await?;
            if run.status != RunStatus::Running {
                return Ok(run);
            }

            let planner = RunPlanner::for_run(&run)?;
            let ready = planner.ready_stages(&run);

            if ready.is_empty() {
                if run.all_stages_completed() {
                    info!(run_id = %id, "all stages completed, handing run to review");
                    self.scheduler
                        .activate(id)
                        .await
                        .map_err(anyhow::Error::from)?;
                    let run = self.store.call(move |s| s.load_run(id)).await?;
                    return Ok(run);
                }
                // Settled but not all completed: a failure pass already
                // recorded the escalation, or state is inconsistent.
                warn!(run_id = %id, "no ready stages and run not complete");
                return Ok(run);
            }

            self.run_pass(&run, ready).await?;
        }
    }

    /// Execute one ready set concurrently and commit the results.
    ///
    /// Every write in the pass goes through the running-only guard: a run
    /// cancelled or escalated while the wave is in flight keeps its settled
    /// disposition and the wave's results are discarded.
    async fn run_pass(&self, run: &PipelineRun, ready: Vec<StageDef>) -> Result<(), EngineError> {
        let id = run.id;
        let ready_ids: Vec<String> = ready.iter().map(|s| s.id.clone()).collect();
        let marked = self
            .store
            .update_run_if_running(id, self.clock.now(), move |run| {
                for stage_id in &ready_ids {
                    if let Some(record) = run.stage_mut(stage_id) {
                        record.status = StageStatus::Running;
                    }
                }
                Ok(())
            })
            .await?;
        if marked.status != RunStatus::Running {
            return Ok(());
        }

        let invocations = ready.iter().map(|stage| self.invoke_stage(run, stage));
        let results: Vec<StageResult> = futures::future::join_all(invocations).await;

        // Commit outputs and failures in one transition.
        let committed = results.clone();
        let run = self
            .store
            .update_run_if_running(id, self.clock.now(), move |run| {
                for result in &committed {
                    let Some(record) = run.stage_mut(&result.stage_id) else {
                        continue;
                    };
                    record.attempts += result.attempts;
                    match &result.outcome {
                        Ok(output) => {
                            record.status = StageStatus::Completed;
                            record.output = Some(output.clone());
                            record.error = None;
                        }
                        Err(failure) => {
                            record.status = StageStatus::Failed;
                            record.error = Some(failure.message.clone());
                        }
                    }
                }
                Ok(())
            })
            .await?;
        if run.status != RunStatus::Running {
            info!(run_id = %id, status = %run.status, "run settled mid-wave, discarding pass results");
            return Ok(());
        }

        for result in &results {
            if let Err(failure) = &result.outcome {
                error!(
                    run_id = %id,
                    stage = %result.stage_id,
                    attempts = result.attempts,
                    "stage failed terminally: {}",
                    failure.message
                );
                self.escalate_stage_failure(&run, &result.stage_id).await?;
                return Ok(());
            }
        }

        for stage in &ready {
            if let Some(gate) = &stage.gate {
                let proceed = self.route_gate(id, &stage.id, gate).await?;
                if !proceed {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Invoke one stage with bounded transient retry and exponential backoff.
    async fn invoke_stage(&self, run: &PipelineRun, stage: &StageDef) -> StageResult {
        let Some(capability) = self.registry.stage(&stage.capability) else {
            return StageResult {
                stage_id: stage.id.clone(),
                attempts: 0,
                outcome: Err(StageFailure::permanent(&format!(
                    "unknown capability {}",
                    stage.capability
                ))),
            };
        };

        let inputs = stage_inputs(run, stage);
        let mut attempt = 1;
        loop {
            match capability.invoke(&stage.id, &inputs).await {
                Ok(output) => {
                    return StageResult {
                        stage_id: stage.id.clone(),
                        attempts: attempt,
                        outcome: Ok(output),
                    };
                }
                Err(failure) => {
                    if !failure.retryable || attempt >= self.config.max_stage_attempts {
                        return StageResult {
                            stage_id: stage.id.clone(),
                            attempts: attempt,
                            outcome: Err(failure),
                        };
                    }
                    let backoff = self.config.retry_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        run_id = %run.id,
                        stage = %stage.id,
                        attempt,
                        "transient stage failure, retrying in {:?}: {}",
                        backoff,
                        failure.message
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Evaluate a completed stage's gate and apply the routed decision.
    /// Returns false when the run escalated and the pass must stop.
    async fn route_gate(
        &self,
        id: Uuid,
        stage_id: &str,
        gate: &crate::definition::GateSpec,
    ) -> Result<bool, EngineError> {
        let check = self
            .registry
            .check(&gate.check)
            .ok_or_else(|| EngineError::UnknownCapability {
                stage: stage_id.to_string(),
                capability: gate.check.clone(),
            })?;

        let run = self.store.call(move |s| s.load_run(id)).await?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        let Some(output) = run.stage(stage_id).and_then(|r| r.output.clone()) else {
            // Gate consulted for a stage that has no committed output; the
            // pass that produced it escalated already.
            return Ok(true);
        };

        let score = match check.evaluate(stage_id, &output).await {
            Ok(score) => score,
            Err(failure) => {
                error!(run_id = %id, stage = %stage_id, "quality check failed: {}", failure.message);
                self.escalate_stage_failure(&run, stage_id).await?;
                return Ok(false);
            }
        };

        let prior_failures = run.gate_retry_count(stage_id);
        let decision = gate::evaluate(gate, prior_failures, &score);
        // The counter records retries actually performed, so it saturates
        // at the configured bound: the failure that escalates is on record
        // in the verdict history but buys no further rework.
        let retry_count = if score.pass {
            prior_failures
        } else {
            (prior_failures + 1).min(gate.max_retries)
        };
        let verdict = GateVerdict {
            stage_id: stage_id.to_string(),
            pass: score.pass,
            retry_count,
            findings: score.findings.clone(),
            decided_at: self.clock.now(),
        };

        match decision {
            GateDecision::Advance => {
                self.store
                    .update_run_if_running(id, self.clock.now(), move |run| {
                        run.gate_history.push(verdict.clone());
                        Ok(())
                    })
                    .await?;
                Ok(true)
            }
            GateDecision::Retry { target_stage } => {
                info!(
                    run_id = %id,
                    gate = %stage_id,
                    target = %target_stage,
                    retry = retry_count,
                    "gate failed within budget, reworking"
                );
                let stage_key = stage_id.to_string();
                self.store
                    .update_run_if_running(id, self.clock.now(), move |run| {
                        run.gate_history.push(verdict.clone());
                        *run.gate_retries.entry(stage_key.clone()).or_insert(0) = retry_count;
                        let planner =
                            RunPlanner::for_run(run).map_err(crate::errors::StoreError::Other)?;
                        planner.reset_for_rework(run, &target_stage);
                        Ok(())
                    })
                    .await?;
                Ok(true)
            }
            GateDecision::Escalate { reason } => {
                warn!(run_id = %id, gate = %stage_id, "gate retry budget exhausted, escalating");
                let stage_key = stage_id.to_string();
                let run = self
                    .store
                    .update_run_if_running(id, self.clock.now(), move |run| {
                        run.gate_history.push(verdict.clone());
                        *run.gate_retries.entry(stage_key.clone()).or_insert(0) = retry_count;
                        run.mark_escalated(reason.as_str());
                        Ok(())
                    })
                    .await?;
                if run.status == RunStatus::Escalated {
                    self.notify_escalation(&run).await;
                }
                Ok(false)
            }
        }
    }

    /// Terminal stage failure: skip everything downstream and escalate.
    async fn escalate_stage_failure(
        &self,
        run: &PipelineRun,
        failed_stage: &str,
    ) -> Result<(), EngineError> {
        let id = run.id;
        let failed = failed_stage.to_string();
        let run = self
            .store
            .update_run_if_running(id, self.clock.now(), move |run| {
                let planner = RunPlanner::for_run(run).map_err(crate::errors::StoreError::Other)?;
                planner.skip_dependents(run, &failed);
                run.mark_escalated(EscalationReason::StageFailure.as_str());
                Ok(())
            })
            .await?;
        if run.status == RunStatus::Escalated {
            self.notify_escalation(&run).await;
        }
        Ok(())
    }

    async fn notify_escalation(&self, run: &PipelineRun) {
        self.dispatcher
            .send(&NotificationContext {
                run_id: run.id,
                assignment_id: None,
                kind: NotificationKind::Escalation,
                recipient: run.review.admin_contact.clone(),
                admin_contact: run.review.admin_contact.clone(),
                deadline: None,
                review_link: review_link(&self.review_base_url, run.id),
            })
            .await;
    }
}

/// Outcome of one stage invocation within a pass.
#[derive(Debug, Clone)]
struct StageResult {
    stage_id: String,
    attempts: u32,
    outcome: Result<serde_json::Value, StageFailure>,
}

/// Inputs handed to a stage capability: upstream outputs keyed by stage id,
/// or the run's client inputs for root stages.
fn stage_inputs(run: &PipelineRun, stage: &StageDef) -> HashMap<String, serde_json::Value> {
    if stage.depends_on.is_empty() {
        return run.inputs.clone();
    }
    stage
        .depends_on
        .iter()
        .filter_map(|dep| {
            run.stage(dep)
                .and_then(|r| r.output.clone())
                .map(|output| (dep.clone(), output))
        })
        .collect()
}
