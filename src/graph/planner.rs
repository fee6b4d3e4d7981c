//! Ready-set planning over a run's stage states.
//!
//! The planner is a pure view over a run: given the snapshotted definition
//! and the per-stage statuses, it decides which stages are ready, which
//! dependents must be skipped after a terminal failure, and which stages
//! re-run when a gate sends content back for rework. Keeping these
//! functions pure in the loaded state is what makes transitions safe to
//! recompute after a crash.

use std::collections::HashSet;

use anyhow::{Context, Result};

use crate::definition::StageDef;
use crate::graph::builder::{GraphBuilder, StageGraph};
use crate::model::{PipelineRun, StageStatus};

/// Plans stage execution for one run.
pub struct RunPlanner {
    graph: StageGraph,
}

impl RunPlanner {
    /// Build a planner from the run's snapshotted definition.
    pub fn for_run(run: &PipelineRun) -> Result<Self> {
        let graph = GraphBuilder::new(run.definition.clone())
            .build()
            .context("Run definition failed graph validation")?;
        Ok(Self { graph })
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    fn completed_set(&self, run: &PipelineRun) -> HashSet<usize> {
        self.graph
            .stages()
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                run.stage(&s.id)
                    .map(|r| r.status == StageStatus::Completed)
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Stages that are pending with all dependencies completed.
    pub fn ready_stages(&self, run: &PipelineRun) -> Vec<StageDef> {
        let completed = self.completed_set(run);
        self.graph
            .stages()
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                let pending = run
                    .stage(&s.id)
                    .map(|r| r.status == StageStatus::Pending)
                    .unwrap_or(false);
                pending && self.graph.dependencies_satisfied(*i, &completed)
            })
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// True once every stage has reached a terminal status.
    pub fn all_settled(&self, run: &PipelineRun) -> bool {
        run.stages.values().all(|r| r.status.is_terminal())
    }

    /// Mark every transitive dependent of a terminally failed stage as
    /// skipped. Already-terminal dependents are left alone.
    pub fn skip_dependents(&self, run: &mut PipelineRun, failed_stage: &str) {
        let Some(idx) = self.graph.get_index(failed_stage) else {
            return;
        };
        for dep_idx in self.graph.transitive_dependents(idx) {
            if let Some(stage) = self.graph.get_stage(dep_idx) {
                if let Some(record) = run.stage_mut(&stage.id) {
                    if !record.status.is_terminal() {
                        record.status = StageStatus::Skipped;
                    }
                }
            }
        }
    }

    /// Reset a rework target and everything downstream of it back to
    /// pending, clearing outputs so the stages re-run from scratch. Gate
    /// retry counters are deliberately preserved on the run.
    pub fn reset_for_rework(&self, run: &mut PipelineRun, target_stage: &str) {
        let Some(idx) = self.graph.get_index(target_stage) else {
            return;
        };
        let mut to_reset: Vec<usize> = self.graph.transitive_dependents(idx).into_iter().collect();
        to_reset.push(idx);

        for stage_idx in to_reset {
            if let Some(stage) = self.graph.get_stage(stage_idx) {
                if let Some(record) = run.stage_mut(&stage.id) {
                    record.status = StageStatus::Pending;
                    record.output = None;
                    record.error = None;
                    record.attempts = 0;
                }
            }
        }
    }
}
