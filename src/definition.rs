//! Declarative pipeline definitions.
//!
//! A definition is the immutable shape of a pipeline: the stage list, the
//! dependency edges between stages, and the gate flags. Definitions are
//! consumed at submission time; each run snapshots its definition, so later
//! edits never affect in-flight runs.

use serde::{Deserialize, Serialize};

/// Gate attached to a stage: after the stage completes, the named quality
/// check runs and its verdict is routed by the gate router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSpec {
    /// Capability name of the quality check to invoke.
    pub check: String,
    /// Stage re-run when the check fails. Usually the gated stage itself,
    /// but a downstream gate may target the upstream writer that produced
    /// the content under review.
    pub rework_stage: String,
    /// Bounded automatic retries before escalation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

/// Immutable definition of a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    /// Stage identifier, unique within the definition.
    pub id: String,
    /// Capability invoked to execute the stage. Opaque external collaborator.
    pub capability: String,
    /// Stage ids that must complete before this stage becomes ready.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Quality gate evaluated after this stage completes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
}

impl StageDef {
    pub fn new(id: &str, capability: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            capability: capability.to_string(),
            depends_on,
            gate: None,
        }
    }

    pub fn with_gate(mut self, check: &str, rework_stage: &str, max_retries: u32) -> Self {
        self.gate = Some(GateSpec {
            check: check.to_string(),
            rework_stage: rework_stage.to_string(),
            max_retries,
        });
        self
    }
}

/// A declarative pipeline graph: stage list plus dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub stages: Vec<StageDef>,
}

impl PipelineDefinition {
    pub fn new(stages: Vec<StageDef>) -> Self {
        Self { stages }
    }

    /// Build a linear chain where each stage depends on the previous one.
    /// Capability names default to the stage ids. Mostly useful in tests.
    pub fn linear(ids: &[&str]) -> Self {
        let stages = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let deps = if i == 0 {
                    Vec::new()
                } else {
                    vec![ids[i - 1].to_string()]
                };
                StageDef::new(id, id, deps)
            })
            .collect();
        Self { stages }
    }

    pub fn stage(&self, id: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Validate structure: unique ids, known dependencies, no cycles.
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::graph::GraphBuilder::new(self.clone()).build()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_definition_chains_dependencies() {
        let def = PipelineDefinition::linear(&["research", "draft", "compliance"]);
        assert_eq!(def.stages.len(), 3);
        assert!(def.stages[0].depends_on.is_empty());
        assert_eq!(def.stages[1].depends_on, vec!["research"]);
        assert_eq!(def.stages[2].depends_on, vec!["draft"]);
    }

    #[test]
    fn test_with_gate_attaches_gate_spec() {
        let stage = StageDef::new("draft", "writer", vec![]).with_gate("style_check", "draft", 3);
        let gate = stage.gate.unwrap();
        assert_eq!(gate.check, "style_check");
        assert_eq!(gate.rework_stage, "draft");
        assert_eq!(gate.max_retries, 3);
    }

    #[test]
    fn test_gate_spec_default_max_retries() {
        let json = r#"{"check": "style_check", "rework_stage": "draft"}"#;
        let gate: GateSpec = serde_json::from_str(json).unwrap();
        assert_eq!(gate.max_retries, 3);
    }

    #[test]
    fn test_definition_json_roundtrip() {
        let def = PipelineDefinition::new(vec![
            StageDef::new("research", "researcher", vec![]),
            StageDef::new("draft", "writer", vec!["research".to_string()])
                .with_gate("style_check", "draft", 2),
        ]);
        let json = serde_json::to_string(&def).unwrap();
        let back: PipelineDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stages.len(), 2);
        assert_eq!(back.stage("draft").unwrap().gate.as_ref().unwrap().max_retries, 2);
    }
}
