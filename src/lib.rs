//! draftflow: an orchestrator for staged content-generation pipelines.
//!
//! A run flows through a validated stage DAG, each stage delegated to an
//! external capability, with quality gates routing failed checks back for
//! bounded rework, an ordered human approval chain with SLA enforcement,
//! and notifications that inform but never block. All state is committed
//! through a versioned checkpoint store so a crashed process resumes from
//! its last committed transition.

pub mod api;
pub mod capability;
pub mod config;
pub mod definition;
pub mod errors;
pub mod gate;
pub mod graph;
pub mod model;
pub mod notify;
pub mod review;
pub mod store;
