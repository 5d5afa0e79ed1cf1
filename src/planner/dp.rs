// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! The planner's dynamic program.
//!
//! For a fixed stage count k, `f(k)` is the minimum over all ordered
//! partitions of the layers into k contiguous groups, with a per-group GPU
//! allocation summing to the template GPU count, of the bottleneck stage
//! time. The outer selection then scores every k with the 1F1B fill/drain
//! model and applies the deterministic tie-break rules.

use std::sync::Arc;

use dashmap::DashMap;

use super::template::{PipelineTemplate, StageExecutionResult, COST_EPSILON};
use super::PlanError;
use crate::profile::LayerExecutionResults;

/// Sentinel for unreachable DP cells.
const INFEASIBLE: f64 = f64::INFINITY;

/// Plans optimal pipeline templates over one layer execution profile.
///
/// Stage cost summaries are cached per `(lo, hi, num_gpus)` so repeated
/// catalogue builds over the same profile reuse them; the cache is
/// concurrent because catalogue builds plan node counts in parallel.
pub struct PipelineTemplateGenerator<'a> {
    profile: &'a LayerExecutionResults,
    num_gpus_per_node: usize,
    stage_cache: DashMap<(usize, usize, usize), Arc<StageExecutionResult>>,
}

impl<'a> PipelineTemplateGenerator<'a> {
    pub fn new(profile: &'a LayerExecutionResults, num_gpus_per_node: usize) -> Self {
        Self {
            profile,
            num_gpus_per_node,
            stage_cache: DashMap::new(),
        }
    }

    fn stage(
        &self,
        lo: usize,
        hi: usize,
        num_gpus: usize,
    ) -> Result<Arc<StageExecutionResult>, PlanError> {
        if let Some(cached) = self.stage_cache.get(&(lo, hi, num_gpus)) {
            return Ok(Arc::clone(&cached));
        }
        let stage = Arc::new(StageExecutionResult::new(
            self.profile,
            lo,
            hi,
            num_gpus,
            self.num_gpus_per_node,
        )?);
        self.stage_cache
            .insert((lo, hi, num_gpus), Arc::clone(&stage));
        Ok(stage)
    }

    fn stage_time(&self, lo: usize, hi: usize, num_gpus: usize) -> Result<f64, PlanError> {
        Ok(self.stage(lo, hi, num_gpus)?.stage_time())
    }

    /// GPU counts a single stage may take: anything that fits within one
    /// node, or a whole-node multiple.
    fn allowed_gpu_counts(&self, total_gpus: usize) -> Vec<usize> {
        let d = self.num_gpus_per_node;
        let mut counts: Vec<usize> = (1..=d.min(total_gpus)).collect();
        let mut multiple = 2 * d;
        while multiple <= total_gpus {
            counts.push(multiple);
            multiple += d;
        }
        counts
    }

    /// Compute the optimal template for `num_nodes` nodes, scoring iteration
    /// time with `num_microbatches` microbatches per step.
    pub fn plan(
        &self,
        num_nodes: usize,
        num_microbatches: usize,
    ) -> Result<PipelineTemplate, PlanError> {
        let num_layers = self.profile.len();
        let total_gpus = num_nodes * self.num_gpus_per_node;

        let infeasible = || PlanError::Infeasible {
            num_nodes,
            num_gpus_per_node: self.num_gpus_per_node,
            num_layers,
        };

        if total_gpus < 1 || num_nodes > num_layers {
            return Err(infeasible());
        }

        let max_stages = num_layers.min(total_gpus);
        let allowed = self.allowed_gpu_counts(total_gpus);

        // dp[s] is indexed by (layer_prefix, gpus_used); back[s] records the
        // (split_point, stage_gpus) that produced each cell. Equal-cost cells
        // keep the first (smallest) candidate so reconstruction is
        // deterministic.
        let width = total_gpus + 1;
        let cell = |i: usize, r: usize| i * width + r;

        let mut dp: Vec<Vec<f64>> = Vec::with_capacity(max_stages + 1);
        let mut back: Vec<Vec<(usize, usize)>> = Vec::with_capacity(max_stages + 1);
        dp.push(Vec::new()); // s = 0 unused
        back.push(Vec::new());

        for stages in 1..=max_stages {
            let mut layer = vec![INFEASIBLE; (num_layers + 1) * width];
            let mut layer_back = vec![(usize::MAX, 0usize); (num_layers + 1) * width];

            if stages == 1 {
                for i in 1..=num_layers {
                    for &g in &allowed {
                        layer[cell(i, g)] = self.stage_time(0, i, g)?;
                        layer_back[cell(i, g)] = (0, g);
                    }
                }
            } else {
                let prev = &dp[stages - 1];
                for i in stages..=num_layers {
                    for r in stages..=total_gpus {
                        let mut best = INFEASIBLE;
                        let mut best_ptr = (usize::MAX, 0usize);
                        for j in (stages - 1)..i {
                            for &g in &allowed {
                                // Previous stages need at least one GPU each.
                                if g + (stages - 1) > r {
                                    break;
                                }
                                let earlier = prev[cell(j, r - g)];
                                if !earlier.is_finite() {
                                    continue;
                                }
                                let candidate = earlier.max(self.stage_time(j, i, g)?);
                                if candidate < best - COST_EPSILON {
                                    best = candidate;
                                    best_ptr = (j, g);
                                }
                            }
                        }
                        layer[cell(i, r)] = best;
                        layer_back[cell(i, r)] = best_ptr;
                    }
                }
            }

            dp.push(layer);
            back.push(layer_back);
        }

        // Outer selection across stage counts.
        let mut best: Option<PipelineTemplate> = None;
        for stages in 1..=max_stages {
            if !dp[stages][cell(num_layers, total_gpus)].is_finite() {
                continue;
            }
            let template = self.reconstruct(
                &back,
                stages,
                num_layers,
                total_gpus,
                num_nodes,
                num_microbatches,
                &cell,
            )?;
            tracing::debug!(
                num_nodes,
                stages,
                iteration_time = template.iteration_time,
                "planner candidate"
            );
            best = match best {
                Some(current) if current.compare(&template).is_le() => Some(current),
                _ => Some(template),
            };
        }

        best.ok_or_else(infeasible)
    }

    #[allow(clippy::too_many_arguments)]
    fn reconstruct(
        &self,
        back: &[Vec<(usize, usize)>],
        num_stages: usize,
        num_layers: usize,
        total_gpus: usize,
        num_nodes: usize,
        num_microbatches: usize,
        cell: &dyn Fn(usize, usize) -> usize,
    ) -> Result<PipelineTemplate, PlanError> {
        let mut stages_rev: Vec<StageExecutionResult> = Vec::with_capacity(num_stages);
        let mut i = num_layers;
        let mut r = total_gpus;
        for s in (1..=num_stages).rev() {
            let (j, g) = back[s][cell(i, r)];
            debug_assert_ne!(j, usize::MAX, "reconstruction hit an unreachable cell");
            stages_rev.push(self.stage(j, i, g)?.as_ref().clone());
            i = j;
            r -= g;
        }
        debug_assert_eq!(i, 0);
        debug_assert_eq!(r, 0);
        stages_rev.reverse();
        Ok(PipelineTemplate::new(
            stages_rev,
            num_nodes,
            self.num_gpus_per_node,
            num_microbatches,
        ))
    }
}

/// Exhaustively enumerate every feasible template. Exponential; intended for
/// cross-checking the DP on small inputs.
pub fn enumerate_templates(
    profile: &LayerExecutionResults,
    num_nodes: usize,
    num_gpus_per_node: usize,
    num_microbatches: usize,
) -> Result<Vec<PipelineTemplate>, PlanError> {
    let generator = PipelineTemplateGenerator::new(profile, num_gpus_per_node);
    let num_layers = profile.len();
    let total_gpus = num_nodes * num_gpus_per_node;
    let allowed = generator.allowed_gpu_counts(total_gpus);

    let mut out = Vec::new();
    let mut stack: Vec<StageExecutionResult> = Vec::new();
    fn recurse(
        generator: &PipelineTemplateGenerator<'_>,
        allowed: &[usize],
        num_layers: usize,
        lo: usize,
        gpus_left: usize,
        stack: &mut Vec<StageExecutionResult>,
        num_nodes: usize,
        num_gpus_per_node: usize,
        num_microbatches: usize,
        out: &mut Vec<PipelineTemplate>,
    ) -> Result<(), PlanError> {
        if lo == num_layers {
            if gpus_left == 0 {
                out.push(PipelineTemplate::new(
                    stack.clone(),
                    num_nodes,
                    num_gpus_per_node,
                    num_microbatches,
                ));
            }
            return Ok(());
        }
        for hi in (lo + 1)..=num_layers {
            for &g in allowed {
                if g > gpus_left {
                    break;
                }
                stack.push(generator.stage(lo, hi, g)?.as_ref().clone());
                recurse(
                    generator,
                    allowed,
                    num_layers,
                    hi,
                    gpus_left - g,
                    stack,
                    num_nodes,
                    num_gpus_per_node,
                    num_microbatches,
                    out,
                )?;
                stack.pop();
            }
        }
        Ok(())
    }
    recurse(
        &generator,
        &allowed,
        num_layers,
        0,
        total_gpus,
        &mut stack,
        num_nodes,
        num_gpus_per_node,
        num_microbatches,
        &mut out,
    )?;
    Ok(out)
}
