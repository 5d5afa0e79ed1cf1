// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Template catalogue: the precomputed `{node count -> template}` map.

use std::collections::BTreeMap;
use std::time::Instant;

use rayon::prelude::*;

use super::dp::PipelineTemplateGenerator;
use super::template::PipelineTemplate;
use super::PlanError;
use crate::profile::LayerExecutionResults;
use crate::telemetry;

/// Templates for every feasible candidate node count, built once at startup.
/// Infeasible counts are retained with their planning error; a run aborts
/// only when the *current* node count has no template.
#[derive(Debug)]
pub struct TemplateCatalogue {
    templates: BTreeMap<usize, PipelineTemplate>,
    failures: BTreeMap<usize, PlanError>,
    num_gpus_per_node: usize,
}

impl TemplateCatalogue {
    /// Plan a template for every node count in `node_counts`.
    ///
    /// Counts are deduplicated; planning runs in parallel per count over a
    /// shared generator so stage cost summaries are computed once.
    pub fn build(
        profile: &LayerExecutionResults,
        node_counts: &[usize],
        num_gpus_per_node: usize,
        num_microbatches: usize,
    ) -> Self {
        let started = Instant::now();
        let generator = PipelineTemplateGenerator::new(profile, num_gpus_per_node);

        let mut counts: Vec<usize> = node_counts.to_vec();
        counts.sort_unstable();
        counts.dedup();

        let results: Vec<(usize, Result<PipelineTemplate, PlanError>)> = counts
            .par_iter()
            .map(|&n| (n, generator.plan(n, num_microbatches)))
            .collect();

        let mut templates = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (n, result) in results {
            match result {
                Ok(template) => {
                    templates.insert(n, template);
                }
                Err(e) => {
                    tracing::warn!(num_nodes = n, error = %e, "no template for node count");
                    failures.insert(n, e);
                }
            }
        }

        telemetry::record_catalogue_build(templates.len(), started.elapsed());
        Self {
            templates,
            failures,
            num_gpus_per_node,
        }
    }

    pub fn get(&self, num_nodes: usize) -> Option<&PipelineTemplate> {
        self.templates.get(&num_nodes)
    }

    pub fn failure(&self, num_nodes: usize) -> Option<&PlanError> {
        self.failures.get(&num_nodes)
    }

    /// Node counts that have a template, ascending.
    pub fn feasible_node_counts(&self) -> Vec<usize> {
        self.templates.keys().copied().collect()
    }

    pub fn num_gpus_per_node(&self) -> usize {
        self.num_gpus_per_node
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::synthetic_profile;

    #[test]
    fn builds_per_count_results() {
        let profile = synthetic_profile(&[1.0; 6], &[1.0; 6]);
        let catalogue = TemplateCatalogue::build(&profile, &[1, 2, 3, 8], 1, 4);

        assert_eq!(catalogue.feasible_node_counts(), vec![1, 2, 3]);
        assert!(catalogue.get(2).is_some());
        // 8 nodes over 6 layers cannot be planned, but the catalogue build
        // itself succeeds and records the failure.
        assert!(catalogue.get(8).is_none());
        assert!(matches!(
            catalogue.failure(8),
            Some(PlanError::Infeasible { .. })
        ));
    }

    #[test]
    fn duplicate_counts_are_planned_once() {
        let profile = synthetic_profile(&[1.0; 4], &[1.0; 4]);
        let catalogue = TemplateCatalogue::build(&profile, &[2, 2, 2], 1, 4);
        assert_eq!(catalogue.feasible_node_counts(), vec![2]);
    }

    #[test]
    fn templates_cover_all_layers() {
        let profile = synthetic_profile(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2.0; 6]);
        let catalogue = TemplateCatalogue::build(&profile, &[1, 2, 3, 4, 5, 6], 1, 8);
        for n in catalogue.feasible_node_counts() {
            let template = catalogue.get(n).unwrap();
            assert_eq!(template.num_layers(), 6);
            assert_eq!(template.total_gpus(), n);
        }
    }
}
