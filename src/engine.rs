// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Per-worker execution engine: the glue between the control plane and the
//! planning/reconfiguration core.
//!
//! Every worker builds an identical engine from the same profile and
//! membership, so pipeline layouts and copy plans agree everywhere without
//! further coordination. The tensor runtime drives the actual compute; this
//! engine only answers "which pipeline am I in, and what must be copied
//! when membership changes".

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

use crate::config::JobConfig;
use crate::control::DistInfo;
use crate::pipeline::{Pipeline, Rank};
use crate::planner::TemplateCatalogue;
use crate::profile::LayerExecutionResults;
use crate::reconfig::{
    CollectiveBackend, ReconfigError, ReconfigOutcome, ReconfigurationEngine,
};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The catalogue has no template for the current cluster size. Other
    /// candidate sizes may have failed too, but only the current one aborts
    /// a run.
    #[error("No pipeline template for {num_nodes} node(s)")]
    NoTemplateForCluster { num_nodes: usize },

    #[error("Reconfiguration error: {0}")]
    Reconfig(#[from] ReconfigError),
}

/// One worker's view of the training job.
pub struct ExecutionEngine {
    catalogue: Arc<TemplateCatalogue>,
    reconfig: ReconfigurationEngine,
    dist: DistInfo,
    rank: Rank,
}

impl ExecutionEngine {
    /// Plan the template catalogue and instantiate the initial pipeline
    /// layout for the current membership.
    ///
    /// The catalogue covers `config.candidate_node_counts`, or every count
    /// up to the current host count when unset. Per-count planning failures
    /// are tolerated; only a missing template for the *current* count is
    /// fatal.
    pub fn new(
        profile: &LayerExecutionResults,
        config: &JobConfig,
        dist: DistInfo,
        rank: Rank,
    ) -> Result<Self, EngineError> {
        let num_nodes = dist.hosts.len();
        let candidates: Vec<usize> = if config.candidate_node_counts.is_empty() {
            (1..=num_nodes).collect()
        } else {
            config.candidate_node_counts.clone()
        };

        let catalogue = Arc::new(TemplateCatalogue::build(
            profile,
            &candidates,
            config.gpus_per_node,
            config.global_microbatches,
        ));
        if catalogue.get(num_nodes).is_none() {
            return Err(EngineError::NoTemplateForCluster { num_nodes });
        }

        let pipelines = ReconfigurationEngine::initial_layout(
            &catalogue,
            num_nodes,
            config.global_microbatches,
        )?;
        tracing::info!(
            num_nodes,
            pipelines = pipelines.len(),
            "instantiated initial pipeline layout"
        );

        let reconfig = ReconfigurationEngine::new(
            Arc::clone(&catalogue),
            pipelines,
            config.global_microbatches,
        );
        Ok(Self {
            catalogue,
            reconfig,
            dist,
            rank,
        })
    }

    pub fn catalogue(&self) -> &TemplateCatalogue {
        &self.catalogue
    }

    pub fn dist_info(&self) -> &DistInfo {
        &self.dist
    }

    pub fn live_pipelines(&self) -> Vec<Pipeline> {
        self.reconfig.live_pipelines()
    }

    /// The pipeline this worker participates in, if any.
    pub fn my_pipeline(&self) -> Option<Pipeline> {
        self.reconfig.pipeline_for_rank(self.rank)
    }

    /// React to a membership change delivered by the control plane: derive
    /// the lost hosts from the old and new host lists, reshape the pipeline
    /// set, and execute the copy plan through `backend`.
    ///
    /// Runs between iterations; the caller guarantees no step is in flight.
    pub fn on_membership_change(
        &mut self,
        new_dist: DistInfo,
        backend: &dyn CollectiveBackend,
    ) -> Result<ReconfigOutcome, EngineError> {
        let lost_hosts: BTreeSet<usize> = self
            .dist
            .hosts
            .iter()
            .enumerate()
            .filter(|(_, host)| new_dist.host_index_of(&host.ip).is_none())
            .map(|(index, _)| index)
            .collect();

        let outcome = self.reconfig.apply_host_loss(&lost_hosts, backend)?;

        // This worker's rank shifts with the survivors.
        if let Some(&new_rank) = outcome.rank_map.get(&self.rank) {
            self.rank = new_rank;
        }
        self.dist = new_dist;
        Ok(outcome)
    }
}
