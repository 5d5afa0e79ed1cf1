// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Stage and pipeline template model.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::profile::{LayerExecutionResults, ProfileError};

/// Fixed per-stage scheduling overhead added to every stage time (ms).
pub const STAGE_FIXED_OVERHEAD_MS: f64 = 0.1;

/// Epsilon for all floating-point cost comparisons. Costs closer than this
/// are considered equal and fall through to the integer tie-break rules.
pub const COST_EPSILON: f64 = 1e-9;

/// A contiguous slice of layers `[lo, hi)` assigned to one pipeline stage
/// running on `num_gpus` GPUs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecutionResult {
    /// Covered layer range, half-open.
    pub layers: (usize, usize),
    pub num_gpus: usize,
    /// Sum of per-layer forward latency (ms).
    pub forward: f64,
    /// Sum of per-layer backward latency (ms).
    pub backward: f64,
    /// Sum of per-layer gradient all-reduce latency at this group size (ms).
    pub sync_cost: f64,
    /// Total memory footprint of the stage in bytes.
    pub mem_required: u64,
}

impl StageExecutionResult {
    /// Build the stage cost summary for layers `[lo, hi)` on `num_gpus` GPUs.
    ///
    /// The all-reduce table is chosen by placement: a stage that fits within
    /// one node (`num_gpus <= num_gpus_per_node`) synchronizes over the
    /// in-node interconnect, a whole-node-spanning stage over the network.
    pub fn new(
        profile: &LayerExecutionResults,
        lo: usize,
        hi: usize,
        num_gpus: usize,
        num_gpus_per_node: usize,
    ) -> Result<Self, ProfileError> {
        debug_assert!(lo < hi && hi <= profile.len());
        let within_node = num_gpus <= num_gpus_per_node;

        let mut forward = 0.0;
        let mut backward = 0.0;
        let mut sync_cost = 0.0;
        let mut mem_required = 0u64;
        for layer in profile.slice(lo, hi) {
            forward += layer.forward;
            backward += layer.backward;
            sync_cost += layer.allreduce_cost(num_gpus, within_node)?;
            mem_required += layer.mem_total();
        }

        Ok(Self {
            layers: (lo, hi),
            num_gpus,
            forward,
            backward,
            sync_cost,
            mem_required,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.1 - self.layers.0
    }

    /// Predicted wall time of one microbatch through this stage:
    /// sharded compute plus gradient synchronization plus fixed overhead.
    pub fn stage_time(&self) -> f64 {
        (self.forward + self.backward) / self.num_gpus as f64
            + self.sync_cost
            + STAGE_FIXED_OVERHEAD_MS
    }
}

/// A rank-independent recipe for one pipeline: the ordered stage partition
/// and per-stage GPU counts for `num_nodes` nodes of `num_gpus_per_node`
/// GPUs each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub stages: Vec<StageExecutionResult>,
    pub num_nodes: usize,
    pub num_gpus_per_node: usize,
    /// Microbatch count the stored `iteration_time` was computed with.
    pub num_microbatches: usize,
    /// Predicted 1F1B iteration time (ms): `(M + stages - 1) * bottleneck`.
    pub iteration_time: f64,
}

impl PipelineTemplate {
    pub fn new(
        stages: Vec<StageExecutionResult>,
        num_nodes: usize,
        num_gpus_per_node: usize,
        num_microbatches: usize,
    ) -> Self {
        let template = Self {
            iteration_time: predicted_iteration_time(&stages, num_microbatches),
            stages,
            num_nodes,
            num_gpus_per_node,
            num_microbatches,
        };
        template.debug_check_invariants();
        template
    }

    fn debug_check_invariants(&self) {
        debug_assert!(!self.stages.is_empty());
        debug_assert_eq!(
            self.total_gpus(),
            self.num_nodes * self.num_gpus_per_node,
            "stage GPU counts must sum to the template GPU count"
        );
        let mut cursor = 0;
        for stage in &self.stages {
            debug_assert_eq!(stage.layers.0, cursor, "stages must tile the layer range");
            debug_assert!(stage.layers.1 > stage.layers.0);
            debug_assert!(
                stage.num_gpus <= self.num_gpus_per_node
                    || stage.num_gpus % self.num_gpus_per_node == 0,
                "a stage either fits within one node or spans whole nodes"
            );
            cursor = stage.layers.1;
        }
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn num_layers(&self) -> usize {
        self.stages.last().map(|s| s.layers.1).unwrap_or(0)
    }

    pub fn total_gpus(&self) -> usize {
        self.stages.iter().map(|s| s.num_gpus).sum()
    }

    /// Time of the slowest stage, the pipeline bottleneck.
    pub fn max_stage_time(&self) -> f64 {
        self.stages.iter().map(|s| s.stage_time()).fold(0.0, f64::max)
    }

    /// Predicted iteration time for an arbitrary microbatch count.
    pub fn iteration_time_with(&self, num_microbatches: usize) -> f64 {
        predicted_iteration_time(&self.stages, num_microbatches)
    }

    /// Variance of per-stage times; second tie-break key.
    pub fn stage_time_variance(&self) -> f64 {
        let times: Vec<f64> = self.stages.iter().map(|s| s.stage_time()).collect();
        let mean = times.iter().sum::<f64>() / times.len() as f64;
        times.iter().map(|t| (t - mean) * (t - mean)).sum::<f64>() / times.len() as f64
    }

    /// Integer partition descriptor `(layer_count, gpu_count)` per stage;
    /// the final, lexicographic tie-break key.
    pub fn partition_descriptor(&self) -> Vec<(usize, usize)> {
        self.stages
            .iter()
            .map(|s| (s.num_layers(), s.num_gpus))
            .collect()
    }

    /// Layer names per stage, in forward order.
    pub fn modules_per_stage(&self, profile: &LayerExecutionResults) -> Vec<Vec<String>> {
        self.stages
            .iter()
            .map(|s| {
                profile
                    .slice(s.layers.0, s.layers.1)
                    .iter()
                    .map(|layer| layer.layer_name.clone())
                    .collect()
            })
            .collect()
    }

    /// Total ordering used to pick the best template: iteration time within
    /// `COST_EPSILON`, then fewer stages, then smaller stage-time variance,
    /// then the lexicographically smaller partition descriptor. Depends only
    /// on the profile and integer partition descriptors, so every process
    /// agrees on the winner.
    pub fn compare(&self, other: &Self) -> Ordering {
        compare_cost(self.iteration_time, other.iteration_time)
            .then_with(|| self.num_stages().cmp(&other.num_stages()))
            .then_with(|| compare_cost(self.stage_time_variance(), other.stage_time_variance()))
            .then_with(|| self.partition_descriptor().cmp(&other.partition_descriptor()))
    }
}

/// Standard 1F1B fill/drain model: `(M + k - 1)` slots of the bottleneck
/// stage time.
fn predicted_iteration_time(stages: &[StageExecutionResult], num_microbatches: usize) -> f64 {
    let bottleneck = stages.iter().map(|s| s.stage_time()).fold(0.0, f64::max);
    (num_microbatches + stages.len() - 1) as f64 * bottleneck
}

/// Epsilon-aware float comparison for planner costs.
pub(crate) fn compare_cost(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= COST_EPSILON {
        Ordering::Equal
    } else if a < b {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}
