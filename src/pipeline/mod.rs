// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Live pipeline instances and their rank grids.
//!
//! A `RankGrid` maps every layer of a pipeline to the ordered global ranks
//! that shard its state. It is a pure function of (template, base rank), so
//! every process derives identical grids without coordination.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::planner::PipelineTemplate;

/// Global rank of one GPU within the collective library.
pub type Rank = usize;

/// `layer_index -> ordered participating ranks` for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankGrid {
    ranks_per_layer: Vec<Vec<Rank>>,
}

impl RankGrid {
    /// Derive the grid by walking stages in order with a rank cursor
    /// starting at `base_rank`: a stage with g GPUs takes the next g ranks
    /// for every layer it covers.
    pub fn derive(template: &PipelineTemplate, base_rank: Rank) -> Self {
        let mut ranks_per_layer = vec![Vec::new(); template.num_layers()];
        let mut cursor = base_rank;
        for stage in &template.stages {
            let ranks: Vec<Rank> = (cursor..cursor + stage.num_gpus).collect();
            for layer in stage.layers.0..stage.layers.1 {
                ranks_per_layer[layer] = ranks.clone();
            }
            cursor += stage.num_gpus;
        }
        debug_assert_eq!(cursor, base_rank + template.total_gpus());
        Self { ranks_per_layer }
    }

    pub fn num_layers(&self) -> usize {
        self.ranks_per_layer.len()
    }

    pub fn ranks_for_layer(&self, layer_index: usize) -> &[Rank] {
        &self.ranks_per_layer[layer_index]
    }

    pub fn contains_rank(&self, rank: Rank) -> bool {
        self.ranks_per_layer.iter().any(|ranks| ranks.contains(&rank))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[Rank])> {
        self.ranks_per_layer
            .iter()
            .enumerate()
            .map(|(layer, ranks)| (layer, ranks.as_slice()))
    }
}

/// One instantiated pipeline: a template bound to concrete ranks, plus the
/// training progress that must survive reconfiguration.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub pipeline_id: usize,
    pub template: Arc<PipelineTemplate>,
    /// Ordered global ranks executing this pipeline; `ranks[0]` is the base.
    pub ranks: Vec<Rank>,
    pub global_step: usize,
    /// Microbatches this pipeline runs per optimizer step.
    pub num_microbatches: usize,
    pub rank_grid: RankGrid,
}

impl Pipeline {
    pub fn new(
        pipeline_id: usize,
        template: Arc<PipelineTemplate>,
        base_rank: Rank,
        num_microbatches: usize,
    ) -> Self {
        let rank_grid = RankGrid::derive(&template, base_rank);
        let ranks = (base_rank..base_rank + template.total_gpus()).collect();
        Self {
            pipeline_id,
            template,
            ranks,
            global_step: 0,
            num_microbatches,
            rank_grid,
        }
    }

    pub fn base_rank(&self) -> Rank {
        self.ranks[0]
    }

    pub fn contains_rank(&self, rank: Rank) -> bool {
        self.ranks.contains(&rank)
    }
}

/// Split the global microbatch count across pipelines proportionally to
/// 1/iteration_time, rounded to integers that always sum to `global`.
///
/// Largest-remainder rounding; remainder ties go to the lower index, so the
/// distribution is identical on every rank.
pub fn distribute_microbatches(global: usize, templates: &[&PipelineTemplate]) -> Vec<usize> {
    if templates.is_empty() {
        return Vec::new();
    }

    let weights: Vec<f64> = templates
        .iter()
        .map(|t| {
            if t.iteration_time > 0.0 {
                1.0 / t.iteration_time
            } else {
                1.0
            }
        })
        .collect();
    let total_weight: f64 = weights.iter().sum();

    let quotas: Vec<f64> = weights
        .iter()
        .map(|w| global as f64 * w / total_weight)
        .collect();
    let mut counts: Vec<usize> = quotas.iter().map(|q| q.floor() as usize).collect();
    let assigned: usize = counts.iter().sum();

    let mut order: Vec<usize> = (0..templates.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = quotas[a] - quotas[a].floor();
        let rb = quotas[b] - quotas[b].floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal).then(a.cmp(&b))
    });
    for &index in order.iter().take(global - assigned) {
        counts[index] += 1;
    }

    debug_assert_eq!(counts.iter().sum::<usize>(), global);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PipelineTemplateGenerator;
    use crate::profile::synthetic_profile;

    fn template(num_nodes: usize, gpus_per_node: usize) -> PipelineTemplate {
        let profile = synthetic_profile(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2.0; 6]);
        PipelineTemplateGenerator::new(&profile, gpus_per_node)
            .plan(num_nodes, 8)
            .unwrap()
    }

    #[test]
    fn grid_walk_covers_all_ranks_exactly_once() {
        let template = template(3, 2);
        let grid = RankGrid::derive(&template, 10);

        let mut seen = std::collections::BTreeSet::new();
        for (_, ranks) in grid.iter() {
            assert!(!ranks.is_empty());
            seen.extend(ranks.iter().copied());
        }
        let expected: std::collections::BTreeSet<Rank> = (10..16).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn grid_derivation_is_deterministic() {
        let template = template(2, 2);
        let a = RankGrid::derive(&template, 4);
        let b = RankGrid::derive(&template, 4);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn pipeline_ranks_follow_base() {
        let template = Arc::new(template(2, 1));
        let pipeline = Pipeline::new(0, Arc::clone(&template), 3, 4);
        assert_eq!(pipeline.ranks, vec![3, 4]);
        assert_eq!(pipeline.base_rank(), 3);
        assert!(pipeline.contains_rank(4));
        assert!(!pipeline.contains_rank(5));
    }

    #[test]
    fn microbatch_distribution_sums_to_global() {
        let t1 = template(1, 1);
        let t2 = template(2, 1);
        let t3 = template(3, 1);
        for global in [1usize, 7, 24, 100] {
            let counts = distribute_microbatches(global, &[&t1, &t2, &t3]);
            assert_eq!(counts.iter().sum::<usize>(), global);
        }
    }

    #[test]
    fn equal_pipelines_split_evenly() {
        let t = template(2, 1);
        let counts = distribute_microbatches(24, &[&t, &t]);
        assert_eq!(counts, vec![12, 12]);
    }
}
