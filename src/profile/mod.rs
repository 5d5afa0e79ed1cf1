// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Per-layer execution profiles.
//!
//! A profile is the immutable input to the pipeline template planner: one row
//! per model layer with forward/backward latency, memory footprint, and
//! all-reduce cost tables keyed by group size. Profiles are produced by an
//! external profiler as CSV and never change after loading.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Profile ingestion and validation errors.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Row {row}: expected layer_index {row}, found {found}")]
    NonContiguousIndex { row: usize, found: usize },

    #[error("Layer {layer}: {field} must be non-negative, found {value}")]
    NegativeTime {
        layer: usize,
        field: &'static str,
        value: f64,
    },

    #[error("Layer {layer}: no all-reduce cost profiled for group size {group_size}")]
    MissingAllreduceCost { layer: usize, group_size: usize },

    #[error("Profile contains no layers")]
    Empty,
}

/// Execution profile of a single model layer.
///
/// `allreduce_in_node` and `allreduce_across_nodes` map a sharding group size
/// to the measured gradient all-reduce latency in milliseconds. The in-node
/// table covers groups that fit on one host; the cross-node table covers
/// groups spanning hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerExecutionResult {
    pub layer_index: usize,
    pub layer_name: String,
    /// Forward latency in milliseconds.
    pub forward: f64,
    /// Backward latency in milliseconds.
    pub backward: f64,
    /// Activation memory in bytes.
    pub mem_activation: u64,
    /// Parameter (+ optimizer state) memory in bytes.
    pub mem_params: u64,
    pub allreduce_in_node: BTreeMap<usize, f64>,
    pub allreduce_across_nodes: BTreeMap<usize, f64>,
}

impl LayerExecutionResult {
    /// All-reduce cost for a sharding group of `group_size` GPUs.
    /// `within_node` selects the in-node table.
    pub fn allreduce_cost(
        &self,
        group_size: usize,
        within_node: bool,
    ) -> Result<f64, ProfileError> {
        let table = if within_node {
            &self.allreduce_in_node
        } else {
            &self.allreduce_across_nodes
        };
        table
            .get(&group_size)
            .copied()
            .ok_or(ProfileError::MissingAllreduceCost {
                layer: self.layer_index,
                group_size,
            })
    }

    pub fn mem_total(&self) -> u64 {
        self.mem_activation + self.mem_params
    }

    fn validate(&self, row: usize) -> Result<(), ProfileError> {
        if self.layer_index != row {
            return Err(ProfileError::NonContiguousIndex {
                row,
                found: self.layer_index,
            });
        }
        if self.forward < 0.0 {
            return Err(ProfileError::NegativeTime {
                layer: self.layer_index,
                field: "forward",
                value: self.forward,
            });
        }
        if self.backward < 0.0 {
            return Err(ProfileError::NegativeTime {
                layer: self.layer_index,
                field: "backward",
                value: self.backward,
            });
        }
        Ok(())
    }
}

/// Immutable, ordered collection of layer profiles (forward order).
#[derive(Debug, Clone)]
pub struct LayerExecutionResults {
    layers: Vec<LayerExecutionResult>,
}

impl LayerExecutionResults {
    pub fn new(layers: Vec<LayerExecutionResult>) -> Result<Self, ProfileError> {
        if layers.is_empty() {
            return Err(ProfileError::Empty);
        }
        for (row, layer) in layers.iter().enumerate() {
            layer.validate(row)?;
        }
        Ok(Self { layers })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> &LayerExecutionResult {
        &self.layers[index]
    }

    pub fn slice(&self, lo: usize, hi: usize) -> &[LayerExecutionResult] {
        &self.layers[lo..hi]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerExecutionResult> {
        self.layers.iter()
    }

    /// Load a profile from CSV.
    ///
    /// Two header layouts are accepted:
    /// - basic: `layer_index,layer_name,forward,backward,mem_required`,
    ///   with all-reduce tables synthesized from the parameter size;
    /// - extended: `mem_activation,mem_params` plus any number of
    ///   `allreduce_in_node_<g>` / `allreduce_across_nodes_<g>` columns.
    pub fn from_csv(path: &Path) -> Result<Self, ProfileError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        let col = |name: &str| headers.iter().position(|h| h == name);
        let require = |name: &str| col(name).ok_or_else(|| ProfileError::MissingColumn(name.into()));

        let idx_index = require("layer_index")?;
        let idx_name = require("layer_name")?;
        let idx_forward = require("forward")?;
        let idx_backward = require("backward")?;

        let idx_mem_required = col("mem_required");
        let idx_mem_activation = col("mem_activation");
        let idx_mem_params = col("mem_params");
        if idx_mem_required.is_none() && (idx_mem_activation.is_none() || idx_mem_params.is_none())
        {
            return Err(ProfileError::MissingColumn("mem_required".into()));
        }

        let mut in_node_cols: Vec<(usize, usize)> = Vec::new();
        let mut cross_node_cols: Vec<(usize, usize)> = Vec::new();
        for (pos, header) in headers.iter().enumerate() {
            if let Some(g) = header.strip_prefix("allreduce_in_node_") {
                if let Ok(g) = g.parse::<usize>() {
                    in_node_cols.push((g, pos));
                }
            } else if let Some(g) = header.strip_prefix("allreduce_across_nodes_") {
                if let Ok(g) = g.parse::<usize>() {
                    cross_node_cols.push((g, pos));
                }
            }
        }

        let parse_f64 = |record: &csv::StringRecord, pos: usize| -> f64 {
            record.get(pos).and_then(|v| v.parse().ok()).unwrap_or(0.0)
        };
        let parse_u64 = |record: &csv::StringRecord, pos: usize| -> u64 {
            record.get(pos).and_then(|v| v.parse().ok()).unwrap_or(0)
        };

        let mut layers = Vec::new();
        for record in reader.records() {
            let record = record?;

            let (mem_activation, mem_params) = match (idx_mem_activation, idx_mem_params) {
                (Some(a), Some(p)) => (parse_u64(&record, a), parse_u64(&record, p)),
                _ => {
                    // Basic layout: a single mem_required column, attributed
                    // entirely to parameters.
                    let mem = parse_u64(&record, idx_mem_required.unwrap_or(0));
                    (0, mem)
                }
            };

            let mut allreduce_in_node: BTreeMap<usize, f64> = in_node_cols
                .iter()
                .map(|&(g, pos)| (g, parse_f64(&record, pos)))
                .collect();
            let mut allreduce_across_nodes: BTreeMap<usize, f64> = cross_node_cols
                .iter()
                .map(|&(g, pos)| (g, parse_f64(&record, pos)))
                .collect();
            if allreduce_in_node.is_empty() {
                allreduce_in_node = synthesize_allreduce(mem_params, DEFAULT_MAX_GROUP, true);
            }
            if allreduce_across_nodes.is_empty() {
                allreduce_across_nodes = synthesize_allreduce(mem_params, DEFAULT_MAX_GROUP, false);
            }

            layers.push(LayerExecutionResult {
                layer_index: record
                    .get(idx_index)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(usize::MAX),
                layer_name: record.get(idx_name).unwrap_or("").to_string(),
                forward: parse_f64(&record, idx_forward),
                backward: parse_f64(&record, idx_backward),
                mem_activation,
                mem_params,
                allreduce_in_node,
                allreduce_across_nodes,
            });
        }

        Self::new(layers)
    }
}

/// Largest group size synthesized for basic profiles without all-reduce
/// columns. Large enough for any realistic per-stage GPU count.
pub const DEFAULT_MAX_GROUP: usize = 64;

/// Intra-node and inter-node effective all-reduce bandwidths (bytes/ms)
/// used when the profile does not carry measured all-reduce columns.
const IN_NODE_BYTES_PER_MS: f64 = 150.0e6;
const CROSS_NODE_BYTES_PER_MS: f64 = 12.5e6;

/// Ring all-reduce cost model: 2(g-1)/g volume factor over the link
/// bandwidth. Group size 1 is free.
fn synthesize_allreduce(
    param_bytes: u64,
    max_group: usize,
    within_node: bool,
) -> BTreeMap<usize, f64> {
    let bandwidth = if within_node {
        IN_NODE_BYTES_PER_MS
    } else {
        CROSS_NODE_BYTES_PER_MS
    };
    (1..=max_group)
        .map(|g| {
            let cost = if g == 1 {
                0.0
            } else {
                2.0 * (g as f64 - 1.0) / g as f64 * param_bytes as f64 / bandwidth
            };
            (g, cost)
        })
        .collect()
}

/// Build an in-memory profile for tests and benchmarks: per-layer forward and
/// backward latencies plus a flat all-reduce table.
pub fn synthetic_profile(forward: &[f64], backward: &[f64]) -> LayerExecutionResults {
    assert_eq!(forward.len(), backward.len());
    let layers = forward
        .iter()
        .zip(backward.iter())
        .enumerate()
        .map(|(i, (&f, &b))| LayerExecutionResult {
            layer_index: i,
            layer_name: format!("layer{}", i),
            forward: f,
            backward: b,
            mem_activation: 1024,
            mem_params: 1024,
            allreduce_in_node: (1..=DEFAULT_MAX_GROUP).map(|g| (g, 0.0)).collect(),
            allreduce_across_nodes: (1..=DEFAULT_MAX_GROUP).map(|g| (g, 0.0)).collect(),
        })
        .collect();
    LayerExecutionResults::new(layers).expect("synthetic profile is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_basic_csv(dir: &tempfile::TempDir, rows: &[(usize, &str, f64, f64, u64)]) -> std::path::PathBuf {
        let path = dir.path().join("profile.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "layer_index,layer_name,forward,backward,mem_required").unwrap();
        for (index, name, forward, backward, mem) in rows {
            writeln!(file, "{},{},{},{},{}", index, name, forward, backward, mem).unwrap();
        }
        path
    }

    #[test]
    fn basic_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_basic_csv(
            &dir,
            &[
                (0, "embed", 1.0, 2.0, 4096),
                (1, "block0", 3.5, 7.0, 8192),
                (2, "head", 0.5, 1.0, 2048),
            ],
        );

        let profile = LayerExecutionResults::from_csv(&path).unwrap();
        assert_eq!(profile.len(), 3);
        assert_eq!(profile.get(1).layer_name, "block0");
        assert_eq!(profile.get(1).forward, 3.5);
        assert_eq!(profile.get(1).mem_params, 8192);
        // Synthesized tables are defined for every group size up to the cap
        // and free for singleton groups.
        assert_eq!(profile.get(0).allreduce_cost(1, true).unwrap(), 0.0);
        assert!(profile.get(0).allreduce_cost(2, false).unwrap() > 0.0);
        assert!(profile.get(0).allreduce_cost(DEFAULT_MAX_GROUP, true).is_ok());
    }

    #[test]
    fn extended_csv_reads_allreduce_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "layer_index,layer_name,forward,backward,mem_activation,mem_params,\
             allreduce_in_node_1,allreduce_in_node_2,allreduce_across_nodes_1,allreduce_across_nodes_2"
        )
        .unwrap();
        writeln!(file, "0,layer0,1.0,2.0,100,200,0.0,0.3,0.0,1.2").unwrap();
        drop(file);

        let profile = LayerExecutionResults::from_csv(&path).unwrap();
        let layer = profile.get(0);
        assert_eq!(layer.mem_activation, 100);
        assert_eq!(layer.mem_params, 200);
        assert_eq!(layer.allreduce_cost(2, true).unwrap(), 0.3);
        assert_eq!(layer.allreduce_cost(2, false).unwrap(), 1.2);
        assert!(matches!(
            layer.allreduce_cost(3, true),
            Err(ProfileError::MissingAllreduceCost { group_size: 3, .. })
        ));
    }

    #[test]
    fn non_contiguous_indices_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_basic_csv(&dir, &[(0, "a", 1.0, 1.0, 1), (2, "b", 1.0, 1.0, 1)]);
        assert!(matches!(
            LayerExecutionResults::from_csv(&path),
            Err(ProfileError::NonContiguousIndex { row: 1, found: 2, .. })
        ));
    }

    #[test]
    fn negative_time_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_basic_csv(&dir, &[(0, "a", -1.0, 1.0, 1)]);
        assert!(matches!(
            LayerExecutionResults::from_csv(&path),
            Err(ProfileError::NegativeTime { field: "forward", .. })
        ));
    }

    #[test]
    fn empty_profile_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_basic_csv(&dir, &[]);
        assert!(matches!(
            LayerExecutionResults::from_csv(&path),
            Err(ProfileError::Empty)
        ));
    }
}
