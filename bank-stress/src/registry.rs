use crate::aggregate::{AggregateSnapshot, OutcomeAggregate};
use crate::workload::TxKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

type AggregateKey = (usize, TxKind);

/// Worker-side table of every loop's aggregate, keyed by (node, kind).
///
/// Loops hold their own `Arc<OutcomeAggregate>` and never touch the map after
/// registering; the map lock only guards insertion and snapshot iteration.
#[derive(Debug, Default)]
pub struct AggregationRegistry {
    aggregates: RwLock<BTreeMap<AggregateKey, Arc<OutcomeAggregate>>>,
}

impl AggregationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the aggregate for (node, kind), creating it on first use.
    pub fn register(&self, node: usize, kind: TxKind) -> Arc<OutcomeAggregate> {
        let mut map = self.aggregates.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry((node, kind))
                .or_insert_with(|| Arc::new(OutcomeAggregate::new(node, kind))),
        )
    }

    pub fn len(&self) -> usize {
        self.aggregates.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots and clears every aggregate in (node, kind) order.
    pub fn snapshot_and_clear(&self) -> Snapshot {
        let map = self.aggregates.read().unwrap_or_else(PoisonError::into_inner);
        Snapshot {
            entries: map.values().map(|agg| agg.snapshot_and_clear()).collect(),
        }
    }

    pub fn peek(&self) -> Snapshot {
        let map = self.aggregates.read().unwrap_or_else(PoisonError::into_inner);
        Snapshot {
            entries: map.values().map(|agg| agg.peek()).collect(),
        }
    }
}

/// Ordered copies of all aggregates, as returned over the control channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub entries: Vec<AggregateSnapshot>,
}

impl Snapshot {
    pub fn get(&self, node: usize, kind: TxKind) -> Option<&AggregateSnapshot> {
        self.entries.iter().find(|e| e.node == node && e.kind == kind)
    }

    pub fn transfer(&self, node: usize) -> Option<&AggregateSnapshot> {
        self.get(node, TxKind::Transfer)
    }

    pub fn sumtotal(&self, node: usize) -> Option<&AggregateSnapshot> {
        self.get(node, TxKind::SumTotal)
    }

    /// Node indexes present in the snapshot, ascending.
    pub fn nodes(&self) -> Vec<usize> {
        self.entries
            .iter()
            .map(|e| e.node)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn violations(&self, node: usize) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.node == node)
            .map(|e| e.violations)
            .sum()
    }

    /// Sum of all outcome counts over all entries.
    pub fn total_outcomes(&self) -> u64 {
        self.entries.iter().map(|e| e.total()).sum()
    }

    /// Tab separated table, one row per (node, kind). Nodes are shown 1-based.
    pub fn render_table(&self) -> String {
        let mut out = String::from("\t\trunning_latency\tmax_latency\tisolation\tfinish\n");
        for entry in &self.entries {
            let running = entry
                .running_latency
                .map(|d| format!("{:.2}", d.as_secs_f64()))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "Node {}: {}\t{}\t\t{:.2}\t\t{}\t{:?}\n",
                entry.node + 1,
                entry.kind,
                running,
                entry.max_latency.as_secs_f64(),
                entry.violations,
                entry.outcomes,
            ));
        }
        out
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_table())
    }
}
