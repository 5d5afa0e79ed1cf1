//! Oobleck - elastic pipeline-parallel training coordinator.
//!
//! Trains very large models across a fleet of GPU hosts and keeps training
//! alive through node loss:
//!
//! - the **planner** turns per-layer execution profiles into optimal
//!   pipeline templates for every plausible node count, once, at startup;
//! - the **control plane** (master + per-host agents + per-GPU workers)
//!   distributes the training script, elects a rendezvous port, and
//!   propagates membership changes;
//! - the **reconfiguration engine** reshapes the live pipelines on node
//!   loss and emits the copy plan that keeps parameter state consistent,
//!   so training resumes without restarting from scratch.
//!
//! Tensor compute, collective primitives, and data loading are external
//! collaborators reached through narrow interfaces (`CollectiveBackend`,
//! the training-entry closure, the profile CSV).

pub mod config;
pub mod control;
pub mod engine;
pub mod pipeline;
pub mod planner;
pub mod profile;
pub mod reconfig;
pub mod telemetry;

pub use config::{ConfigError, JobConfig};
pub use engine::{EngineError, ExecutionEngine};
pub use pipeline::{distribute_microbatches, Pipeline, Rank, RankGrid};
pub use planner::{PipelineTemplate, PlanError, StageExecutionResult, TemplateCatalogue};
pub use profile::{LayerExecutionResult, LayerExecutionResults, ProfileError};
pub use reconfig::{
    CollectiveBackend, CopyOp, InMemoryCollective, ReconfigError, ReconfigOutcome,
    ReconfigurationEngine,
};
