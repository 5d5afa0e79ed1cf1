// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Pipeline template planning.
//!
//! The planner turns a layer execution profile and a target node count into a
//! `PipelineTemplate`: an ordered stage partition with per-stage GPU counts
//! whose predicted iteration time is minimal. Templates for every plausible
//! node count are computed once at startup and stored in a
//! `TemplateCatalogue`.

mod catalogue;
mod dp;
mod template;

pub use catalogue::TemplateCatalogue;
pub use dp::{enumerate_templates, PipelineTemplateGenerator};
pub use template::{
    PipelineTemplate, StageExecutionResult, COST_EPSILON, STAGE_FIXED_OVERHEAD_MS,
};
pub(crate) use template::compare_cost;

use thiserror::Error;

use crate::profile::ProfileError;

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(
        "Infeasible configuration: {num_nodes} node(s) x {num_gpus_per_node} GPU(s) \
         for {num_layers} layer(s)"
    )]
    Infeasible {
        num_nodes: usize,
        num_gpus_per_node: usize,
        num_layers: usize,
    },

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),
}
