// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Reconfiguration engine.
//!
//! On membership change the engine reshapes the set of live pipelines: it
//! drops pipelines touching lost hosts, picks a new template multiset for the
//! survivors, and emits a copy plan that makes every new pipeline's layer
//! state equal to a surviving replica's. The same inputs produce the same
//! outputs on every rank, so no coordination is needed beyond the membership
//! event itself.

mod collective;

pub use collective::{
    CollectiveBackend, CollectiveError, InMemoryCollective, NoopCollective, RecordedBroadcast,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::pipeline::{distribute_microbatches, Pipeline, Rank};
use crate::planner::{compare_cost, TemplateCatalogue};
use crate::telemetry;

#[derive(Debug, Error)]
pub enum ReconfigError {
    /// Every replica of some layer was on lost hosts; training state is gone.
    #[error("Unrecoverable: all replicas of layer {layer_index} were lost")]
    Unrecoverable { layer_index: usize },

    /// No combination of catalogue templates fits the surviving node count.
    #[error("No template multiset covers {surviving_nodes} surviving node(s)")]
    InfeasibleMultiset { surviving_nodes: usize },

    #[error("Collective error: {0}")]
    Collective(#[from] CollectiveError),
}

/// One entry of the copy plan: `src_rank` broadcasts the state of
/// `layer_index` to `dst_rank`. Ranks are pre-reconfiguration ids, the ids
/// the collective library still has at copy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    pub src_rank: Rank,
    pub dst_rank: Rank,
    pub layer_index: usize,
}

/// Result of one reconfiguration pass.
#[derive(Debug)]
pub struct ReconfigOutcome {
    /// The new live pipelines, with post-reconfiguration contiguous ranks.
    pub pipelines: Vec<Pipeline>,
    /// Ordered copy plan in pre-reconfiguration rank ids.
    pub copy_plan: Vec<CopyOp>,
    /// Old rank -> new rank for every survivor.
    pub rank_map: BTreeMap<Rank, Rank>,
}

/// Reshapes the live pipeline set on membership change.
///
/// The pipeline set is only mutated here, under the reconfiguration lock;
/// training code reads it between iterations.
pub struct ReconfigurationEngine {
    catalogue: Arc<TemplateCatalogue>,
    global_microbatches: usize,
    pipelines: Mutex<Vec<Pipeline>>,
}

impl ReconfigurationEngine {
    pub fn new(
        catalogue: Arc<TemplateCatalogue>,
        initial_pipelines: Vec<Pipeline>,
        global_microbatches: usize,
    ) -> Self {
        Self {
            catalogue,
            global_microbatches,
            pipelines: Mutex::new(initial_pipelines),
        }
    }

    /// Build the startup pipeline layout for `num_nodes` nodes: the
    /// throughput-maximizing template multiset, instantiated over contiguous
    /// ranks with the global microbatch count split proportionally.
    pub fn initial_layout(
        catalogue: &TemplateCatalogue,
        num_nodes: usize,
        global_microbatches: usize,
    ) -> Result<Vec<Pipeline>, ReconfigError> {
        let parts = select_template_multiset(catalogue, num_nodes)?;
        Ok(instantiate_parts(
            catalogue,
            &parts,
            global_microbatches,
        ))
    }

    /// Current live pipelines (cloned snapshot).
    pub fn live_pipelines(&self) -> Vec<Pipeline> {
        self.pipelines.lock().clone()
    }

    /// The pipeline executing `rank`, if any.
    pub fn pipeline_for_rank(&self, rank: Rank) -> Option<Pipeline> {
        self.pipelines
            .lock()
            .iter()
            .find(|p| p.contains_rank(rank))
            .cloned()
    }

    /// Reconfigure after losing whole hosts, identified by node index in the
    /// pre-loss host list. Convenience wrapper mapping node indices to the
    /// rank blocks they own.
    pub fn apply_host_loss(
        &self,
        lost_host_indices: &BTreeSet<usize>,
        backend: &dyn CollectiveBackend,
    ) -> Result<ReconfigOutcome, ReconfigError> {
        let gpus_per_node = self.catalogue.num_gpus_per_node();
        let lost_ranks: BTreeSet<Rank> = lost_host_indices
            .iter()
            .flat_map(|&host| (host * gpus_per_node)..((host + 1) * gpus_per_node))
            .collect();
        self.apply(&lost_ranks, backend)
    }

    /// Run the reconfiguration algorithm to completion.
    ///
    /// This is a global barrier: the caller must ensure no training step is
    /// in flight. With `lost` empty the pipeline set is returned unchanged
    /// and the copy plan is empty.
    pub fn apply(
        &self,
        lost_ranks: &BTreeSet<Rank>,
        backend: &dyn CollectiveBackend,
    ) -> Result<ReconfigOutcome, ReconfigError> {
        let mut pipelines = self.pipelines.lock();

        if lost_ranks.is_empty() {
            return Ok(ReconfigOutcome {
                pipelines: pipelines.clone(),
                copy_plan: Vec::new(),
                rank_map: pipelines
                    .iter()
                    .flat_map(|p| p.ranks.iter().map(|&r| (r, r)))
                    .collect(),
            });
        }

        // Step 1: drop every pipeline touching a lost rank.
        let survivors: Vec<&Pipeline> = pipelines
            .iter()
            .filter(|p| p.ranks.iter().all(|r| !lost_ranks.contains(r)))
            .collect();

        let num_layers = pipelines
            .first()
            .map(|p| p.rank_grid.num_layers())
            .unwrap_or(0);

        // Layer coverage before anything else: losing the last replica of a
        // layer is unrecoverable no matter what layouts would still fit.
        for layer_index in 0..num_layers {
            let covered = survivors
                .iter()
                .any(|p| !p.rank_grid.ranks_for_layer(layer_index).is_empty());
            if !covered {
                return Err(ReconfigError::Unrecoverable { layer_index });
            }
        }

        // Step 2: budget surviving ranks and pick the new template multiset.
        let surviving_old_ranks: Vec<Rank> = pipelines
            .iter()
            .flat_map(|p| p.ranks.iter().copied())
            .filter(|r| !lost_ranks.contains(r))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let gpus_per_node = self.catalogue.num_gpus_per_node();
        let surviving_nodes = surviving_old_ranks.len() / gpus_per_node;
        let parts = select_template_multiset(&self.catalogue, surviving_nodes)?;

        // Step 3: assignment. Survivors keep their relative order; new ranks
        // are contiguous over them. Pipeline slots are ordered stickily:
        // each surviving pipeline claims a matching slot in base-rank order
        // so aligned survivors stay on their own ranks and copy volume drops.
        let rank_map: BTreeMap<Rank, Rank> = surviving_old_ranks
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();
        let ordered_parts = order_parts_stickily(&parts, &survivors);

        let mut new_pipelines =
            instantiate_parts(&self.catalogue, &ordered_parts, self.global_microbatches);
        let max_step = pipelines.iter().map(|p| p.global_step).max().unwrap_or(0);
        for pipeline in &mut new_pipelines {
            pipeline.global_step = max_step;
        }

        // Step 4: copy plan, in old rank ids.
        let old_of = |new_rank: Rank| surviving_old_ranks[new_rank];
        let mut copy_plan: Vec<CopyOp> = Vec::new();
        let mut groups: Vec<(Rank, usize, Vec<Rank>)> = Vec::new();
        for pipeline in &new_pipelines {
            for (layer_index, new_ranks) in pipeline.rank_grid.iter() {
                let dst_old: Vec<Rank> = new_ranks.iter().map(|&r| old_of(r)).collect();
                let source = choose_source_replica(&survivors, layer_index, &dst_old)
                    .ok_or(ReconfigError::Unrecoverable { layer_index })?;
                let src_ranks = source.rank_grid.ranks_for_layer(layer_index);
                let root = src_ranks[0];

                let destinations: Vec<Rank> = dst_old
                    .iter()
                    .copied()
                    .filter(|dst| !src_ranks.contains(dst))
                    .collect();
                if destinations.is_empty() {
                    continue;
                }
                for &dst in &destinations {
                    copy_plan.push(CopyOp {
                        src_rank: root,
                        dst_rank: dst,
                        layer_index,
                    });
                }
                groups.push((root, layer_index, destinations));
            }
        }

        // Step 5: execute. Every rank walks the same group list in the same
        // order, so ad-hoc broadcast groups form identically everywhere.
        for (root, layer_index, destinations) in &groups {
            let mut group = Vec::with_capacity(destinations.len() + 1);
            group.push(*root);
            group.extend(destinations.iter().copied());
            backend.broadcast_layer(&group, *root, *layer_index)?;
        }

        tracing::info!(
            lost = lost_ranks.len(),
            surviving_nodes,
            new_pipelines = new_pipelines.len(),
            copies = copy_plan.len(),
            "reconfiguration complete"
        );
        telemetry::record_reconfiguration(copy_plan.len(), new_pipelines.len());

        // Step 6: swap.
        *pipelines = new_pipelines.clone();

        Ok(ReconfigOutcome {
            pipelines: new_pipelines,
            copy_plan,
            rank_map,
        })
    }
}

/// Pick the multiset of catalogue node counts summing to `num_nodes` that
/// maximizes total predicted throughput (sum of 1/iteration_time). Ties
/// prefer fewer distinct templates, then fewer pipelines, then the
/// lexicographically larger part list; all keys are deterministic.
fn select_template_multiset(
    catalogue: &TemplateCatalogue,
    num_nodes: usize,
) -> Result<Vec<usize>, ReconfigError> {
    let infeasible = ReconfigError::InfeasibleMultiset {
        surviving_nodes: num_nodes,
    };
    if num_nodes == 0 {
        return Err(infeasible);
    }

    let counts = catalogue.feasible_node_counts();

    // Unbounded-knapsack DP over node budget; parts kept sorted descending.
    let mut best: Vec<Option<(f64, Vec<usize>)>> = vec![None; num_nodes + 1];
    best[0] = Some((0.0, Vec::new()));
    for budget in 1..=num_nodes {
        for &n in counts.iter().rev() {
            if n > budget {
                continue;
            }
            let Some((throughput, parts)) = best[budget - n].clone() else {
                continue;
            };
            let template = catalogue.get(n).expect("feasible count has a template");
            let candidate_throughput = throughput + 1.0 / template.iteration_time;
            let mut candidate_parts = parts;
            candidate_parts.push(n);
            candidate_parts.sort_unstable_by(|a, b| b.cmp(a));

            let replace = match &best[budget] {
                None => true,
                Some((current_throughput, current_parts)) => {
                    match compare_cost(*current_throughput, candidate_throughput) {
                        std::cmp::Ordering::Less => true,
                        std::cmp::Ordering::Greater => false,
                        std::cmp::Ordering::Equal => {
                            let current_distinct =
                                current_parts.iter().collect::<BTreeSet<_>>().len();
                            let candidate_distinct =
                                candidate_parts.iter().collect::<BTreeSet<_>>().len();
                            candidate_distinct
                                .cmp(&current_distinct)
                                .then(candidate_parts.len().cmp(&current_parts.len()))
                                .then_with(|| current_parts.cmp(&candidate_parts))
                                .is_lt()
                        }
                    }
                }
            };
            if replace {
                best[budget] = Some((candidate_throughput, candidate_parts));
            }
        }
    }

    best[num_nodes]
        .take()
        .map(|(_, parts)| parts)
        .ok_or(infeasible)
}

/// Instantiate one pipeline per part over contiguous rank blocks, splitting
/// the global microbatch count proportionally to predicted throughput.
fn instantiate_parts(
    catalogue: &TemplateCatalogue,
    parts: &[usize],
    global_microbatches: usize,
) -> Vec<Pipeline> {
    let templates: Vec<Arc<crate::planner::PipelineTemplate>> = parts
        .iter()
        .map(|&n| {
            Arc::new(
                catalogue
                    .get(n)
                    .expect("selected multiset only contains feasible counts")
                    .clone(),
            )
        })
        .collect();
    let template_refs: Vec<&crate::planner::PipelineTemplate> =
        templates.iter().map(|t| t.as_ref()).collect();
    let microbatches = distribute_microbatches(global_microbatches, &template_refs);

    let mut pipelines = Vec::with_capacity(parts.len());
    let mut base_rank = 0;
    for (pipeline_id, (template, num_microbatches)) in
        templates.into_iter().zip(microbatches).enumerate()
    {
        let total_gpus = template.total_gpus();
        pipelines.push(Pipeline::new(
            pipeline_id,
            template,
            base_rank,
            num_microbatches,
        ));
        base_rank += total_gpus;
    }
    pipelines
}

/// Order pipeline slots so surviving pipelines land on matching slots in
/// base-rank order. Purely a copy-volume heuristic; any order is correct.
fn order_parts_stickily(parts: &[usize], survivors: &[&Pipeline]) -> Vec<usize> {
    let mut remaining: Vec<usize> = parts.to_vec();
    remaining.sort_unstable_by(|a, b| b.cmp(a));

    let mut ordered = Vec::with_capacity(parts.len());
    for survivor in survivors {
        let n = survivor.template.num_nodes;
        if let Some(pos) = remaining.iter().position(|&part| part == n) {
            remaining.remove(pos);
            ordered.push(n);
        }
    }
    ordered.extend(remaining);
    ordered
}

/// Choose the surviving replica to copy a layer from: the one whose ranks
/// for the layer overlap the destination set the most (skipping copies the
/// destinations already cover), tie-broken by pipeline id.
fn choose_source_replica<'a>(
    survivors: &[&'a Pipeline],
    layer_index: usize,
    dst_old_ranks: &[Rank],
) -> Option<&'a Pipeline> {
    survivors
        .iter()
        .max_by_key(|p| {
            let overlap = p
                .rank_grid
                .ranks_for_layer(layer_index)
                .iter()
                .filter(|r| dst_old_ranks.contains(*r))
                .count();
            (overlap, std::cmp::Reverse(p.pipeline_id))
        })
        .copied()
}
