//! The pipeline graph: validated structure, ready-set planning, and the
//! engine that drives runs through it.

mod builder;
mod engine;
mod planner;

pub use builder::{GraphBuilder, StageGraph, StageIndex};
pub use engine::{EngineConfig, PipelineEngine};
pub use planner::RunPlanner;
