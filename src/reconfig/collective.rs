// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Collective backend capability.
//!
//! The reconfiguration engine drives layer-state copies through this trait
//! rather than calling a collective library directly, so tests can inject an
//! in-memory fake and the production wrapper stays a thin adapter.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use thiserror::Error;

use crate::pipeline::Rank;

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("Broadcast of layer {layer_index} from rank {root} failed: {reason}")]
    BroadcastFailed {
        layer_index: usize,
        root: Rank,
        reason: String,
    },
}

/// Point-to-point broadcast capability.
///
/// `group` always contains `root`, and every rank walks the copy plan in the
/// same order, so groups form identically everywhere.
pub trait CollectiveBackend: Send + Sync {
    fn broadcast_layer(
        &self,
        group: &[Rank],
        root: Rank,
        layer_index: usize,
    ) -> Result<(), CollectiveError>;
}

/// Backend that performs no communication. Used for dry runs where only the
/// copy plan itself is of interest.
pub struct NoopCollective;

impl CollectiveBackend for NoopCollective {
    fn broadcast_layer(
        &self,
        _group: &[Rank],
        _root: Rank,
        _layer_index: usize,
    ) -> Result<(), CollectiveError> {
        Ok(())
    }
}

/// A recorded broadcast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBroadcast {
    pub group: Vec<Rank>,
    pub root: Rank,
    pub layer_index: usize,
}

/// In-memory fake: tracks which rank holds which layer states and records
/// every broadcast group formed.
#[derive(Default)]
pub struct InMemoryCollective {
    holdings: Mutex<BTreeMap<Rank, BTreeSet<usize>>>,
    broadcasts: Mutex<Vec<RecordedBroadcast>>,
}

impl InMemoryCollective {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `rank` as holding state for `layers`.
    pub fn seed(&self, rank: Rank, layers: impl IntoIterator<Item = usize>) {
        self.holdings.lock().entry(rank).or_default().extend(layers);
    }

    pub fn holds(&self, rank: Rank, layer_index: usize) -> bool {
        self.holdings
            .lock()
            .get(&rank)
            .is_some_and(|layers| layers.contains(&layer_index))
    }

    pub fn broadcasts(&self) -> Vec<RecordedBroadcast> {
        self.broadcasts.lock().clone()
    }

    pub fn num_broadcasts(&self) -> usize {
        self.broadcasts.lock().len()
    }
}

impl CollectiveBackend for InMemoryCollective {
    fn broadcast_layer(
        &self,
        group: &[Rank],
        root: Rank,
        layer_index: usize,
    ) -> Result<(), CollectiveError> {
        if !group.contains(&root) {
            return Err(CollectiveError::BroadcastFailed {
                layer_index,
                root,
                reason: "root is not a member of the broadcast group".into(),
            });
        }

        let mut holdings = self.holdings.lock();
        let root_holds = holdings
            .get(&root)
            .is_some_and(|layers| layers.contains(&layer_index));
        if !root_holds {
            return Err(CollectiveError::BroadcastFailed {
                layer_index,
                root,
                reason: "root does not hold the layer state".into(),
            });
        }
        for &rank in group {
            holdings.entry(rank).or_default().insert(layer_index);
        }
        drop(holdings);

        self.broadcasts.lock().push(RecordedBroadcast {
            group: group.to_vec(),
            root,
            layer_index,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_propagates_state() {
        let collective = InMemoryCollective::new();
        collective.seed(0, [3]);

        collective.broadcast_layer(&[0, 2], 0, 3).unwrap();
        assert!(collective.holds(2, 3));
        assert_eq!(collective.num_broadcasts(), 1);
    }

    #[test]
    fn broadcast_without_state_fails() {
        let collective = InMemoryCollective::new();
        let result = collective.broadcast_layer(&[0, 1], 0, 7);
        assert!(matches!(
            result,
            Err(CollectiveError::BroadcastFailed { layer_index: 7, .. })
        ));
    }
}
