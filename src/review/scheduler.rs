//! Review assignment scheduler.
//!
//! Owns the human approval chain for a run: an ordered list of at most
//! three reviewers, exactly one of whom is active (pending or held) at a
//! time. Deadlines are enforced by a periodic [`ReviewScheduler::tick`]
//! sweep rather than per-assignment timers, so missed deadlines are
//! detected on the next sweep even after a process restart.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{SchedulerError, StoreError};
use crate::graph::RunPlanner;
use crate::model::{
    AssignmentStatus, NotificationKind, PipelineRun, ReviewAction, ReviewAssignment, RunStatus,
};
use crate::notify::{Dispatcher, NotificationContext, review_link};
use crate::review::clock::Clock;
use crate::store::StoreHandle;

/// Upper bound on the approval chain length.
pub const MAX_REVIEWERS: usize = 3;

/// What a recorded decision did to the run, so the caller knows whether
/// the graph engine must be re-entered.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    /// A non-final reviewer approved; the next slot is now pending.
    Advanced { next_assignment: Uuid },
    /// The final reviewer approved; the run is complete.
    RunCompleted,
    /// A reviewer rejected; the run is terminally rejected.
    RunRejected,
    /// A reviewer requested rework. The target stage and its dependents
    /// were reset; the caller must re-enter the graph engine.
    RevisionRequested { target_stage: String },
}

/// Counters from one sweep, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reminders: u32,
    pub auto_approved: u32,
    pub held: u32,
    pub hold_renotices: u32,
    /// Chains whose active slot was re-derived from persisted state after
    /// an interrupted transition.
    pub repaired: u32,
}

pub struct ReviewScheduler {
    store: StoreHandle,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    review_base_url: String,
}

impl ReviewScheduler {
    pub fn new(
        store: StoreHandle,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        review_base_url: &str,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            review_base_url: review_base_url.to_string(),
        }
    }

    /// Start (or restart, after rework) the approval chain for a run.
    ///
    /// Creates one slot per configured reviewer on first activation; on
    /// re-activation after a revision loop the existing slots are reset
    /// so the whole chain reviews the reworked content. The first slot
    /// becomes pending with a fresh deadline and the run moves to
    /// `awaiting_review`.
    pub async fn activate(&self, run_id: Uuid) -> Result<ReviewAssignment, SchedulerError> {
        let run = self.store.call(move |s| s.load_run(run_id)).await?;
        let reviewers = run.review.reviewers.clone();
        if reviewers.is_empty() || reviewers.len() > MAX_REVIEWERS {
            return Err(SchedulerError::InvalidReviewerCount {
                max: MAX_REVIEWERS,
                got: reviewers.len(),
            });
        }

        let now = self.clock.now();
        let existing = self.store.call(move |s| s.load_assignments(run_id)).await?;

        let mut assignments = if existing.is_empty() {
            let created: Vec<ReviewAssignment> = reviewers
                .iter()
                .enumerate()
                .map(|(i, reviewer)| {
                    ReviewAssignment::queued(
                        run_id,
                        reviewer,
                        (i + 1) as u32,
                        i == reviewers.len() - 1,
                    )
                })
                .collect();
            let to_insert = created.clone();
            self.store
                .call(move |s| s.insert_assignments(&to_insert))
                .await?;
            created
        } else {
            let mut reset = existing;
            for a in &mut reset {
                a.status = AssignmentStatus::Queued;
                a.assigned_at = None;
                a.deadline = None;
                a.completed_at = None;
                a.action = None;
                a.note = None;
                a.target_stage = None;
                a.reminded = false;
                a.last_notified_at = None;
            }
            reset
        };

        assignments[0].activate(now, run.review.sla());
        for a in &assignments {
            let a = a.clone();
            self.store.call(move |s| s.update_assignment(&a)).await?;
        }

        self.store
            .update_run(run_id, now, |run| {
                run.status = RunStatus::AwaitingReview;
                Ok(())
            })
            .await?;

        let first = assignments[0].clone();
        info!(
            run_id = %run_id,
            reviewer = %first.reviewer,
            deadline = ?first.deadline,
            "review chain activated"
        );
        self.dispatcher
            .send(&self.ctx(&run, &first, NotificationKind::Assignment, &first.reviewer))
            .await;

        Ok(first)
    }

    /// Record a reviewer's decision on an active assignment.
    ///
    /// Only pending or held assignments accept decisions; everything else
    /// is a conflict. A held final assignment resolved here is the only
    /// way a held run leaves the hold state.
    pub async fn submit_decision(
        &self,
        assignment_id: Uuid,
        action: ReviewAction,
        target_stage: Option<String>,
        note: Option<String>,
    ) -> Result<DecisionOutcome, SchedulerError> {
        let mut assignment = self
            .store
            .call(move |s| s.load_assignment(assignment_id))
            .await?;
        if !assignment.status.is_active() {
            return Err(SchedulerError::DecisionConflict {
                id: assignment_id,
                status: assignment.status.to_string(),
            });
        }

        let run_id = assignment.run_id;
        let run = self.store.call(move |s| s.load_run(run_id)).await?;
        let now = self.clock.now();

        match action {
            ReviewAction::Approve => {
                self.resolve(
                    &mut assignment,
                    AssignmentStatus::Approved,
                    action,
                    None,
                    note,
                    now,
                )
                .await?;

                let next = self
                    .store
                    .call(move |s| s.load_assignments(run_id))
                    .await?
                    .into_iter()
                    .find(|a| a.ord == assignment.ord + 1);

                match next {
                    Some(mut next) => {
                        next.activate(now, run.review.sla());
                        if self.claim_next_slot(&next).await? {
                            info!(run_id = %run_id, reviewer = %next.reviewer, "review advanced to next slot");
                            self.dispatcher
                                .send(&self.ctx(&run, &next, NotificationKind::Assignment, &next.reviewer))
                                .await;
                        }
                        // Bump the run version so concurrent writers serialize.
                        self.store.update_run(run_id, now, |_| Ok(())).await?;
                        Ok(DecisionOutcome::Advanced {
                            next_assignment: next.id,
                        })
                    }
                    None => {
                        self.store
                            .update_run(run_id, now, |run| {
                                run.status = RunStatus::Complete;
                                Ok(())
                            })
                            .await?;
                        info!(run_id = %run_id, "final approval recorded, run complete");
                        Ok(DecisionOutcome::RunCompleted)
                    }
                }
            }
            ReviewAction::Reject => {
                self.resolve(
                    &mut assignment,
                    AssignmentStatus::Rejected,
                    action,
                    None,
                    note,
                    now,
                )
                .await?;
                self.store
                    .update_run(run_id, now, |run| {
                        run.status = RunStatus::Rejected;
                        Ok(())
                    })
                    .await?;
                info!(run_id = %run_id, "run rejected by reviewer");
                Ok(DecisionOutcome::RunRejected)
            }
            ReviewAction::Revise => {
                let target = target_stage.ok_or(SchedulerError::MissingTargetStage)?;
                if run.definition.stage(&target).is_none() {
                    return Err(SchedulerError::UnknownTargetStage { stage: target });
                }

                self.resolve(
                    &mut assignment,
                    AssignmentStatus::RevisionRequested,
                    action,
                    Some(target.clone()),
                    note,
                    now,
                )
                .await?;

                let reset_target = target.clone();
                self.store
                    .update_run(run_id, now, move |run| {
                        let planner = RunPlanner::for_run(run).map_err(StoreError::Other)?;
                        planner.reset_for_rework(run, &reset_target);
                        run.status = RunStatus::RevisionRequested;
                        Ok(())
                    })
                    .await?;

                info!(run_id = %run_id, target = %target, "revision requested, stages reset");
                Ok(DecisionOutcome::RevisionRequested {
                    target_stage: target,
                })
            }
        }
    }

    /// Sweep every active assignment against the wall clock.
    ///
    /// Sends approaching-deadline reminders, auto-approves timed-out
    /// non-final slots (activating the next reviewer with a fresh
    /// deadline), places timed-out final slots on hold, and repeats hold
    /// notices at the SLA interval. Holds never resolve here: only a
    /// recorded decision releases a held run. Notification failures are
    /// absorbed by the dispatcher and never block the sweep.
    pub async fn tick(&self) -> Result<TickReport, SchedulerError> {
        let now = self.clock.now();
        let active = self.store.call(|s| s.active_assignments()).await?;
        let mut report = TickReport::default();

        for assignment in active {
            let run_id = assignment.run_id;
            let run = match self.store.call(move |s| s.load_run(run_id)).await {
                Ok(run) => run,
                Err(e) => {
                    warn!(run_id = %run_id, "skipping assignment sweep, run load failed: {}", e);
                    continue;
                }
            };
            // A run that left review (rejected, escalated) keeps its rows
            // for audit but is no longer swept.
            if run.status != RunStatus::AwaitingReview {
                continue;
            }

            match assignment.status {
                AssignmentStatus::Pending => {
                    self.sweep_pending(&run, assignment, now, &mut report)
                        .await?;
                }
                AssignmentStatus::Held => {
                    self.sweep_held(&run, assignment, now, &mut report).await?;
                }
                _ => {}
            }
        }

        self.repair_chains(now, &mut report).await?;

        Ok(report)
    }

    /// Re-derive the active slot for runs whose chain stalled between two
    /// writes, e.g. a crash after a decision was persisted but before the
    /// follow-up activation or run transition landed. The persisted rows
    /// are the source of truth: a recorded rejection or revision settles
    /// the run, a queued successor after a resolved predecessor is
    /// activated, and a fully approved chain completes the run.
    async fn repair_chains(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let run_ids = self
            .store
            .call(|s| s.runs_with_status(RunStatus::AwaitingReview))
            .await?;
        for run_id in run_ids {
            let assignments = self.store.call(move |s| s.load_assignments(run_id)).await?;
            if assignments.is_empty() || assignments.iter().any(|a| a.status.is_active()) {
                continue;
            }
            let run = self.store.call(move |s| s.load_run(run_id)).await?;
            if run.status != RunStatus::AwaitingReview {
                continue;
            }
            warn!(run_id = %run_id, "review chain has no active slot, repairing from persisted state");

            if assignments
                .iter()
                .any(|a| a.status == AssignmentStatus::Rejected)
            {
                self.store
                    .update_run(run_id, now, |run| {
                        run.status = RunStatus::Rejected;
                        Ok(())
                    })
                    .await?;
            } else if let Some(revise) = assignments
                .iter()
                .find(|a| a.status == AssignmentStatus::RevisionRequested)
            {
                let target = revise.target_stage.clone();
                self.store
                    .update_run(run_id, now, move |run| {
                        if let Some(target) = &target {
                            let planner = RunPlanner::for_run(run).map_err(StoreError::Other)?;
                            planner.reset_for_rework(run, target);
                        }
                        run.status = RunStatus::RevisionRequested;
                        Ok(())
                    })
                    .await?;
            } else if let Some(next) = assignments
                .iter()
                .find(|a| a.status == AssignmentStatus::Queued)
            {
                let mut next = next.clone();
                next.activate(now, run.review.sla());
                if self.claim_next_slot(&next).await? {
                    self.store.update_run(run_id, now, |_| Ok(())).await?;
                    self.dispatcher
                        .send(&self.ctx(&run, &next, NotificationKind::Assignment, &next.reviewer))
                        .await;
                }
            } else {
                // Every slot approved; only the final run transition was lost.
                self.store
                    .update_run(run_id, now, |run| {
                        run.status = RunStatus::Complete;
                        Ok(())
                    })
                    .await?;
            }
            report.repaired += 1;
        }
        Ok(())
    }

    async fn sweep_pending(
        &self,
        run: &PipelineRun,
        mut assignment: ReviewAssignment,
        now: chrono::DateTime<chrono::Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let Some(deadline) = assignment.deadline else {
            warn!(assignment_id = %assignment.id, "pending assignment has no deadline, skipping");
            return Ok(());
        };

        if now >= deadline {
            if assignment.is_final {
                assignment.status = AssignmentStatus::Held;
                assignment.last_notified_at = Some(now);
                if !self.sweep_write(&assignment).await? {
                    return Ok(());
                }
                self.store.update_run(run.id, now, |_| Ok(())).await?;

                warn!(
                    run_id = %run.id,
                    reviewer = %assignment.reviewer,
                    "final review deadline missed, run held for human decision"
                );
                self.dispatcher
                    .send(&self.ctx(run, &assignment, NotificationKind::HoldNotice, &assignment.reviewer))
                    .await;
                self.dispatcher
                    .send(&self.ctx(run, &assignment, NotificationKind::HoldNotice, &run.review.admin_contact))
                    .await;
                report.held += 1;
            } else {
                assignment.status = AssignmentStatus::AutoApproved;
                assignment.completed_at = Some(now);
                if !self.sweep_write(&assignment).await? {
                    // A decision landed between the sweep's read and this
                    // write; the decision path owns the chain now.
                    return Ok(());
                }

                let run_id = run.id;
                let next = self
                    .store
                    .call(move |s| s.load_assignments(run_id))
                    .await?
                    .into_iter()
                    .find(|a| a.ord == assignment.ord + 1);
                let Some(mut next) = next else {
                    warn!(run_id = %run.id, ord = assignment.ord, "non-final assignment has no successor");
                    return Ok(());
                };
                next.activate(now, run.review.sla());
                if !self.claim_next_slot(&next).await? {
                    return Ok(());
                }
                self.store.update_run(run.id, now, |_| Ok(())).await?;

                info!(
                    run_id = %run.id,
                    timed_out = %assignment.reviewer,
                    next = %next.reviewer,
                    "review deadline missed, slot auto-approved and chain advanced"
                );
                self.dispatcher
                    .send(&self.ctx(run, &assignment, NotificationKind::AutoApproveNotice, &assignment.reviewer))
                    .await;
                self.dispatcher
                    .send(&self.ctx(run, &next, NotificationKind::Assignment, &next.reviewer))
                    .await;
                self.dispatcher
                    .send(&self.ctx(run, &assignment, NotificationKind::Timeout, &run.review.admin_contact))
                    .await;
                report.auto_approved += 1;
            }
        } else if !assignment.reminded && now >= deadline - run.review.reminder_lead() {
            assignment.reminded = true;
            if !self.sweep_write(&assignment).await? {
                return Ok(());
            }

            self.dispatcher
                .send(&self.ctx(run, &assignment, NotificationKind::Reminder, &assignment.reviewer))
                .await;
            report.reminders += 1;
        }

        Ok(())
    }

    async fn sweep_held(
        &self,
        run: &PipelineRun,
        mut assignment: ReviewAssignment,
        now: chrono::DateTime<chrono::Utc>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let due = match assignment.last_notified_at {
            Some(last) => now - last >= run.review.sla(),
            None => true,
        };
        if !due {
            return Ok(());
        }

        assignment.last_notified_at = Some(now);
        if !self.sweep_write(&assignment).await? {
            return Ok(());
        }

        self.dispatcher
            .send(&self.ctx(run, &assignment, NotificationKind::HoldNotice, &assignment.reviewer))
            .await;
        self.dispatcher
            .send(&self.ctx(run, &assignment, NotificationKind::HoldNotice, &run.review.admin_contact))
            .await;
        report.hold_renotices += 1;

        Ok(())
    }

    /// Write a sweep-driven transition for a slot believed active. Returns
    /// false when the slot was resolved in the meantime; the sweep yields
    /// to whatever landed first.
    async fn sweep_write(&self, assignment: &ReviewAssignment) -> Result<bool, SchedulerError> {
        let saved = assignment.clone();
        match self
            .store
            .call(move |s| s.update_active_assignment(&saved))
            .await
        {
            Ok(()) => Ok(true),
            Err(StoreError::AssignmentConflict { id }) => {
                info!(assignment_id = %id, "slot resolved during sweep, leaving it be");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim a queued slot for activation. Returns false when another
    /// writer activated the slot first; the winner already sent the
    /// assignment notification.
    async fn claim_next_slot(&self, next: &ReviewAssignment) -> Result<bool, SchedulerError> {
        let saved = next.clone();
        match self
            .store
            .call(move |s| s.activate_assignment(&saved))
            .await
        {
            Ok(()) => Ok(true),
            Err(StoreError::AssignmentConflict { id }) => {
                warn!(assignment_id = %id, "next review slot already claimed, skipping activation");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a decision on an active slot. The store write carries a
    /// pending-or-held precondition, so the sweep and a human decision
    /// racing for the same slot cannot both land; the loser surfaces as a
    /// decision conflict against the status that actually stuck.
    async fn resolve(
        &self,
        assignment: &mut ReviewAssignment,
        status: AssignmentStatus,
        action: ReviewAction,
        target_stage: Option<String>,
        note: Option<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), SchedulerError> {
        assignment.status = status;
        assignment.action = Some(action);
        assignment.target_stage = target_stage;
        assignment.note = note;
        assignment.completed_at = Some(now);
        let saved = assignment.clone();
        match self
            .store
            .call(move |s| s.update_active_assignment(&saved))
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::AssignmentConflict { id }) => {
                let current = self.store.call(move |s| s.load_assignment(id)).await?;
                Err(SchedulerError::DecisionConflict {
                    id,
                    status: current.status.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ctx(
        &self,
        run: &PipelineRun,
        assignment: &ReviewAssignment,
        kind: NotificationKind,
        recipient: &str,
    ) -> NotificationContext {
        NotificationContext {
            run_id: run.id,
            assignment_id: Some(assignment.id),
            kind,
            recipient: recipient.to_string(),
            admin_contact: run.review.admin_contact.clone(),
            deadline: assignment.deadline,
            review_link: review_link(&self.review_base_url, run.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PipelineDefinition;
    use crate::model::{ReviewConfig, StageStatus};
    use crate::notify::testing::FakeChannel;
    use crate::review::clock::ManualClock;
    use crate::store::CheckpointStore;
    use chrono::{Duration, Utc};
    use std::collections::HashMap;

    struct Harness {
        scheduler: ReviewScheduler,
        store: StoreHandle,
        clock: ManualClock,
        channel: Arc<FakeChannel>,
    }

    fn harness() -> Harness {
        let store = StoreHandle::new(CheckpointStore::open_in_memory().unwrap());
        let clock = ManualClock::at(Utc::now());
        let channel = Arc::new(FakeChannel::reliable());
        let dispatcher = Arc::new(Dispatcher::new(
            channel.clone(),
            store.clone(),
            Arc::new(clock.clone()),
        ));
        let scheduler = ReviewScheduler::new(
            store.clone(),
            dispatcher,
            Arc::new(clock.clone()),
            "https://review.example",
        );
        Harness {
            scheduler,
            store,
            clock,
            channel,
        }
    }

    async fn seed_run(h: &Harness, reviewers: &[&str]) -> Uuid {
        let review = ReviewConfig {
            reviewers: reviewers.iter().map(|r| r.to_string()).collect(),
            sla_hours: 24,
            reminder_lead_hours: 4,
            admin_contact: "admin".into(),
        };
        let mut run = PipelineRun::new(
            PipelineDefinition::linear(&["research", "draft"]),
            HashMap::new(),
            review,
            h.clock.now(),
        );
        for record in run.stages.values_mut() {
            record.status = StageStatus::Completed;
            record.output = Some(serde_json::json!({"ok": true}));
        }
        let id = run.id;
        h.store.call(move |s| s.create_run(&run)).await.unwrap();
        id
    }

    async fn assignments(h: &Harness, run_id: Uuid) -> Vec<ReviewAssignment> {
        h.store
            .call(move |s| s.load_assignments(run_id))
            .await
            .unwrap()
    }

    async fn run(h: &Harness, run_id: Uuid) -> PipelineRun {
        h.store.call(move |s| s.load_run(run_id)).await.unwrap()
    }

    #[tokio::test]
    async fn test_activate_creates_chain_and_notifies_first_reviewer() {
        let h = harness();
        let run_id = seed_run(&h, &["alice", "bob", "carol"]).await;

        let first = h.scheduler.activate(run_id).await.unwrap();
        assert_eq!(first.reviewer, "alice");
        assert_eq!(first.status, AssignmentStatus::Pending);
        assert_eq!(first.deadline, Some(h.clock.now() + Duration::hours(24)));

        let all = assignments(&h, run_id).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].status, AssignmentStatus::Pending);
        assert_eq!(all[1].status, AssignmentStatus::Queued);
        assert_eq!(all[2].status, AssignmentStatus::Queued);
        assert!(all[2].is_final);
        assert!(!all[0].is_final);

        assert_eq!(run(&h, run_id).await.status, RunStatus::AwaitingReview);

        let delivered = h.channel.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "alice");
    }

    #[tokio::test]
    async fn test_activate_rejects_invalid_reviewer_counts() {
        let h = harness();
        let run_id = seed_run(&h, &[]).await;
        assert!(matches!(
            h.scheduler.activate(run_id).await,
            Err(SchedulerError::InvalidReviewerCount { got: 0, .. })
        ));

        let run_id = seed_run(&h, &["a", "b", "c", "d"]).await;
        assert!(matches!(
            h.scheduler.activate(run_id).await,
            Err(SchedulerError::InvalidReviewerCount { got: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_approve_advances_then_completes() {
        let h = harness();
        let run_id = seed_run(&h, &["alice", "bob"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        let outcome = h
            .scheduler
            .submit_decision(first.id, ReviewAction::Approve, None, None)
            .await
            .unwrap();
        let next_id = match outcome {
            DecisionOutcome::Advanced { next_assignment } => next_assignment,
            other => panic!("expected Advanced, got {:?}", other),
        };
        assert_eq!(run(&h, run_id).await.status, RunStatus::AwaitingReview);

        let all = assignments(&h, run_id).await;
        assert_eq!(all[0].status, AssignmentStatus::Approved);
        assert_eq!(all[1].status, AssignmentStatus::Pending);
        assert_eq!(all[1].id, next_id);

        let outcome = h
            .scheduler
            .submit_decision(next_id, ReviewAction::Approve, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, DecisionOutcome::RunCompleted);
        assert_eq!(run(&h, run_id).await.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_reject_terminates_run() {
        let h = harness();
        let run_id = seed_run(&h, &["alice", "bob"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        let outcome = h
            .scheduler
            .submit_decision(
                first.id,
                ReviewAction::Reject,
                None,
                Some("off brand".into()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, DecisionOutcome::RunRejected);
        assert_eq!(run(&h, run_id).await.status, RunStatus::Rejected);

        let all = assignments(&h, run_id).await;
        assert_eq!(all[0].status, AssignmentStatus::Rejected);
        assert_eq!(all[0].note.as_deref(), Some("off brand"));
        // The second reviewer is never consulted.
        assert_eq!(all[1].status, AssignmentStatus::Queued);
    }

    #[tokio::test]
    async fn test_revise_resets_target_and_downstream() {
        let h = harness();
        let run_id = seed_run(&h, &["alice"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        let outcome = h
            .scheduler
            .submit_decision(
                first.id,
                ReviewAction::Revise,
                Some("research".into()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DecisionOutcome::RevisionRequested {
                target_stage: "research".into()
            }
        );

        let run = run(&h, run_id).await;
        assert_eq!(run.status, RunStatus::RevisionRequested);
        assert_eq!(run.stage("research").unwrap().status, StageStatus::Pending);
        assert_eq!(run.stage("draft").unwrap().status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_revise_requires_known_target() {
        let h = harness();
        let run_id = seed_run(&h, &["alice"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        assert!(matches!(
            h.scheduler
                .submit_decision(first.id, ReviewAction::Revise, None, None)
                .await,
            Err(SchedulerError::MissingTargetStage)
        ));
        assert!(matches!(
            h.scheduler
                .submit_decision(first.id, ReviewAction::Revise, Some("nope".into()), None)
                .await,
            Err(SchedulerError::UnknownTargetStage { .. })
        ));
    }

    #[tokio::test]
    async fn test_decision_on_resolved_assignment_conflicts() {
        let h = harness();
        let run_id = seed_run(&h, &["alice"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        h.scheduler
            .submit_decision(first.id, ReviewAction::Approve, None, None)
            .await
            .unwrap();
        assert!(matches!(
            h.scheduler
                .submit_decision(first.id, ReviewAction::Approve, None, None)
                .await,
            Err(SchedulerError::DecisionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_reactivation_after_revision_resets_chain() {
        let h = harness();
        let run_id = seed_run(&h, &["alice", "bob"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();
        h.scheduler
            .submit_decision(first.id, ReviewAction::Approve, None, None)
            .await
            .unwrap();

        let second = assignments(&h, run_id).await[1].clone();
        h.scheduler
            .submit_decision(
                second.id,
                ReviewAction::Revise,
                Some("draft".into()),
                None,
            )
            .await
            .unwrap();

        // Rework done; chain restarts from the first reviewer.
        let reactivated = h.scheduler.activate(run_id).await.unwrap();
        assert_eq!(reactivated.reviewer, "alice");

        let all = assignments(&h, run_id).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, AssignmentStatus::Pending);
        assert_eq!(all[1].status, AssignmentStatus::Queued);
        assert!(all[1].action.is_none());
    }

    #[tokio::test]
    async fn test_tick_sends_reminder_once() {
        let h = harness();
        let run_id = seed_run(&h, &["alice"]).await;
        h.scheduler.activate(run_id).await.unwrap();

        // Before the reminder window: nothing.
        h.clock.advance(Duration::hours(19));
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.reminders, 0);

        // Inside the 4h lead window.
        h.clock.advance(Duration::hours(2));
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.reminders, 1);

        // Not repeated.
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.reminders, 0);
    }

    #[tokio::test]
    async fn test_tick_auto_approves_non_final_timeout() {
        let h = harness();
        let run_id = seed_run(&h, &["alice", "bob"]).await;
        h.scheduler.activate(run_id).await.unwrap();

        h.clock.advance(Duration::hours(25));
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.auto_approved, 1);

        let all = assignments(&h, run_id).await;
        assert_eq!(all[0].status, AssignmentStatus::AutoApproved);
        assert_eq!(all[1].status, AssignmentStatus::Pending);
        // Fresh deadline from the moment of activation, not the old one.
        assert_eq!(all[1].deadline, Some(h.clock.now() + Duration::hours(24)));

        let recipients: Vec<String> =
            h.channel.delivered().into_iter().map(|(r, _)| r).collect();
        assert!(recipients.contains(&"bob".to_string()));
        assert!(recipients.contains(&"admin".to_string()));
    }

    #[tokio::test]
    async fn test_tick_holds_final_timeout_and_repeats_notices() {
        let h = harness();
        let run_id = seed_run(&h, &["alice"]).await;
        h.scheduler.activate(run_id).await.unwrap();

        h.clock.advance(Duration::hours(25));
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.held, 1);
        assert_eq!(report.auto_approved, 0);

        let all = assignments(&h, run_id).await;
        assert_eq!(all[0].status, AssignmentStatus::Held);
        assert_eq!(run(&h, run_id).await.status, RunStatus::AwaitingReview);

        // Sweeping again immediately does not re-notify.
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.hold_renotices, 0);

        // One SLA interval later the hold notice repeats; the slot never
        // auto-approves no matter how long it waits.
        h.clock.advance(Duration::hours(24));
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.hold_renotices, 1);
        h.clock.advance(Duration::hours(24));
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.hold_renotices, 1);
        assert_eq!(
            assignments(&h, run_id).await[0].status,
            AssignmentStatus::Held
        );
    }

    /// Simulate a process dying after an assignment resolution was
    /// persisted but before the follow-up write landed.
    async fn interrupt_after_resolution(
        h: &Harness,
        assignment_id: Uuid,
        status: AssignmentStatus,
        target_stage: Option<&str>,
    ) {
        let mut a = h
            .store
            .call(move |s| s.load_assignment(assignment_id))
            .await
            .unwrap();
        a.status = status;
        a.completed_at = Some(h.clock.now());
        a.target_stage = target_stage.map(str::to_string);
        h.store
            .call(move |s| s.update_active_assignment(&a))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tick_repairs_interrupted_advance() {
        let h = harness();
        let run_id = seed_run(&h, &["alice", "bob"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        interrupt_after_resolution(&h, first.id, AssignmentStatus::Approved, None).await;

        h.clock.advance(Duration::hours(1));
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.repaired, 1);

        let all = assignments(&h, run_id).await;
        assert_eq!(all[0].status, AssignmentStatus::Approved);
        assert_eq!(all[1].status, AssignmentStatus::Pending);
        assert_eq!(all[1].deadline, Some(h.clock.now() + Duration::hours(24)));
        assert_eq!(run(&h, run_id).await.status, RunStatus::AwaitingReview);

        let recipients: Vec<String> =
            h.channel.delivered().into_iter().map(|(r, _)| r).collect();
        assert!(recipients.contains(&"bob".to_string()));

        // The repaired chain is stable: the next sweep changes nothing.
        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.repaired, 0);
    }

    #[tokio::test]
    async fn test_tick_repairs_interrupted_final_approval() {
        let h = harness();
        let run_id = seed_run(&h, &["alice"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        interrupt_after_resolution(&h, first.id, AssignmentStatus::Approved, None).await;

        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(run(&h, run_id).await.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_tick_repairs_interrupted_rejection() {
        let h = harness();
        let run_id = seed_run(&h, &["alice", "bob"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        interrupt_after_resolution(&h, first.id, AssignmentStatus::Rejected, None).await;

        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(run(&h, run_id).await.status, RunStatus::Rejected);
        // The rejection settles the chain; the successor is never activated.
        assert_eq!(
            assignments(&h, run_id).await[1].status,
            AssignmentStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_tick_repairs_interrupted_revision() {
        let h = harness();
        let run_id = seed_run(&h, &["alice"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        interrupt_after_resolution(
            &h,
            first.id,
            AssignmentStatus::RevisionRequested,
            Some("research"),
        )
        .await;

        let report = h.scheduler.tick().await.unwrap();
        assert_eq!(report.repaired, 1);

        let run = run(&h, run_id).await;
        assert_eq!(run.status, RunStatus::RevisionRequested);
        assert_eq!(run.stage("research").unwrap().status, StageStatus::Pending);
        assert_eq!(run.stage("draft").unwrap().status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_held_assignment_still_accepts_decision() {
        let h = harness();
        let run_id = seed_run(&h, &["alice"]).await;
        let first = h.scheduler.activate(run_id).await.unwrap();

        h.clock.advance(Duration::hours(25));
        h.scheduler.tick().await.unwrap();
        assert_eq!(
            assignments(&h, run_id).await[0].status,
            AssignmentStatus::Held
        );

        let outcome = h
            .scheduler
            .submit_decision(first.id, ReviewAction::Approve, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, DecisionOutcome::RunCompleted);
        assert_eq!(run(&h, run_id).await.status, RunStatus::Complete);
    }
}
