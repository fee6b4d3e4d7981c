//! Graph builder for constructing dependency graphs from stage definitions.
//!
//! The builder takes a pipeline definition and constructs a directed acyclic
//! graph used to decide which stages are ready to execute.

use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet};

use crate::definition::{PipelineDefinition, StageDef};

/// Index into the stage list.
pub type StageIndex = usize;

/// A directed acyclic graph of stages.
#[derive(Debug)]
pub struct StageGraph {
    /// Stages indexed by their position in the definition.
    stages: Vec<StageDef>,
    /// Map from stage id to index.
    index_map: HashMap<String, StageIndex>,
    /// Forward edges: index -> stages that depend on it.
    forward_edges: Vec<Vec<StageIndex>>,
    /// Reverse edges: index -> stages it depends on.
    reverse_edges: Vec<Vec<StageIndex>>,
}

impl StageGraph {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get_stage(&self, index: StageIndex) -> Option<&StageDef> {
        self.stages.get(index)
    }

    pub fn get_index(&self, id: &str) -> Option<StageIndex> {
        self.index_map.get(id).copied()
    }

    pub fn stages(&self) -> &[StageDef] {
        &self.stages
    }

    /// Stages that depend on the given stage (forward edges).
    pub fn dependents(&self, index: StageIndex) -> &[StageIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stages the given stage depends on (reverse edges).
    pub fn dependencies(&self, index: StageIndex) -> &[StageIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Stage ids of all transitive dependents of the given stage,
    /// excluding the stage itself. Used when a gate sends a stage back for
    /// rework: everything downstream of it must re-run too.
    pub fn transitive_dependents(&self, index: StageIndex) -> HashSet<StageIndex> {
        let mut seen = HashSet::new();
        let mut queue = vec![index];
        while let Some(node) = queue.pop() {
            for &dep in self.dependents(node) {
                if seen.insert(dep) {
                    queue.push(dep);
                }
            }
        }
        seen
    }

    /// Check if all declared dependencies of a stage are in the completed set.
    pub fn dependencies_satisfied(
        &self,
        index: StageIndex,
        completed: &HashSet<StageIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }
}

/// Builder for constructing stage graphs.
pub struct GraphBuilder {
    definition: PipelineDefinition,
}

impl GraphBuilder {
    pub fn new(definition: PipelineDefinition) -> Self {
        Self { definition }
    }

    /// Build the stage graph.
    ///
    /// This validates the graph structure:
    /// - Stage ids must be unique
    /// - All dependencies must reference existing stages
    /// - Gate rework targets must reference existing stages
    /// - No cycles are allowed
    pub fn build(self) -> Result<StageGraph> {
        let stages = self.definition.stages;
        if stages.is_empty() {
            bail!("Pipeline definition has no stages");
        }

        let mut index_map = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if index_map.contains_key(&stage.id) {
                bail!("Duplicate stage id: {}", stage.id);
            }
            index_map.insert(stage.id.clone(), i);
        }

        let mut forward_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); stages.len()];
        let mut reverse_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); stages.len()];

        for (to_idx, stage) in stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Unknown dependency '{}' in stage '{}': no stage with that id exists",
                        dep,
                        stage.id
                    )
                })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }

            if let Some(ref gate) = stage.gate {
                if !index_map.contains_key(&gate.rework_stage) {
                    bail!(
                        "Gate on stage '{}' targets unknown rework stage '{}'",
                        stage.id,
                        gate.rework_stage
                    );
                }
            }
        }

        let graph = StageGraph {
            stages,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &StageGraph) -> Result<()> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<StageIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let cycle_stages: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get_stage(i).map(|s| s.id.as_str()))
                .collect();

            bail!(
                "Cycle detected in stage dependencies. Involved stages: {:?}",
                cycle_stages
            );
        }

        Ok(())
    }
}
