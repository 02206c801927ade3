// Per-loop outcome statistics.
//
// Each workload loop owns one OutcomeAggregate. The loop appends, the control
// responder snapshots and clears. Both go through the same mutex so a
// snapshot never sees half an append.

use crate::workload::TxKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Outcome label of a successful iteration.
pub const COMMIT: &str = "commit";

const ABORT_MARKER: &str = "is aborted on node";
const CENSORED: &str = "<censored>";

fn gid_pattern() -> &'static Regex {
    static GID: OnceLock<Regex> = OnceLock::new();
    GID.get_or_init(|| Regex::new(r"MTM-.+\)").expect("global transaction id pattern is valid"))
}

/// Turns an error message into a histogram label.
///
/// Abort messages carry the global transaction id of the failed attempt
/// (`MTM-<node>-<xid>-<ts> (...)`), which differs on every attempt; it is
/// replaced by `<censored>` so identical aborts land in one bucket. Other
/// messages are only trimmed.
pub fn normalize_outcome(raw: &str) -> String {
    let msg = raw.trim();
    if msg.contains(ABORT_MARKER) {
        gid_pattern().replace_all(msg, CENSORED).into_owned()
    } else {
        msg.to_string()
    }
}

/// Copy of one aggregate taken by the snapshot protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub node: usize,
    pub kind: TxKind,
    /// Age of the iteration that was in flight when the snapshot was taken.
    #[serde(with = "humantime_serde")]
    pub running_latency: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,
    pub violations: u64,
    pub outcomes: BTreeMap<String, u64>,
}

impl AggregateSnapshot {
    pub fn commits(&self) -> u64 {
        self.outcomes.get(COMMIT).copied().unwrap_or(0)
    }

    pub fn has_commits(&self) -> bool {
        self.outcomes.contains_key(COMMIT)
    }

    /// Number of iterations (any outcome) in the window.
    pub fn total(&self) -> u64 {
        self.outcomes.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.violations == 0 && self.max_latency.is_zero()
    }
}

#[derive(Debug, Default)]
struct AggregateState {
    max_latency: Duration,
    outcomes: BTreeMap<String, u64>,
    violations: u64,
    in_flight_since: Option<Instant>,
}

#[derive(Debug)]
pub struct OutcomeAggregate {
    node: usize,
    kind: TxKind,
    state: Mutex<AggregateState>,
}

impl OutcomeAggregate {
    pub fn new(node: usize, kind: TxKind) -> Self {
        OutcomeAggregate {
            node,
            kind,
            state: Mutex::new(AggregateState::default()),
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn kind(&self) -> TxKind {
        self.kind
    }

    // A panic while holding the lock cannot leave the counters half-written,
    // so a poisoned mutex is still usable.
    fn lock(&self) -> MutexGuard<'_, AggregateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the start of an iteration and returns its start instant.
    pub fn start_tx(&self) -> Instant {
        let now = Instant::now();
        self.lock().in_flight_since = Some(now);
        now
    }

    /// Records one finished iteration under `label`.
    pub fn append(&self, label: &str, latency: Duration) {
        self.record(label, latency, false);
    }

    // Outcome and violation go in under one lock, so a snapshot never
    // separates them.
    fn record(&self, label: &str, latency: Duration, violation: bool) {
        let mut state = self.lock();
        if violation {
            state.violations += 1;
        }
        if latency > state.max_latency {
            state.max_latency = latency;
        }
        match state.outcomes.get_mut(label) {
            Some(count) => *count += 1,
            None => {
                state.outcomes.insert(label.to_string(), 1);
            }
        }
        state.in_flight_since = None;
    }

    /// Normalizes `outcome` and appends it with the latency measured from `started`.
    pub fn finish_tx(&self, started: Instant, outcome: &str) {
        let label = normalize_outcome(outcome);
        self.append(&label, started.elapsed());
    }

    /// Like `finish_tx`, for an iteration that also observed a violation.
    pub fn finish_tx_with_violation(&self, started: Instant, outcome: &str) {
        let label = normalize_outcome(outcome);
        self.record(&label, started.elapsed(), true);
    }

    pub fn record_violation(&self) {
        self.lock().violations += 1;
    }

    /// Returns a copy of the counters and resets them, as one step.
    pub fn snapshot_and_clear(&self) -> AggregateSnapshot {
        let mut state = self.lock();
        let snapshot = AggregateSnapshot {
            node: self.node,
            kind: self.kind,
            running_latency: state.in_flight_since.map(|since| since.elapsed()),
            max_latency: state.max_latency,
            violations: state.violations,
            outcomes: std::mem::take(&mut state.outcomes),
        };
        state.max_latency = Duration::ZERO;
        state.violations = 0;
        snapshot
    }

    /// Copy of the counters without clearing them.
    pub fn peek(&self) -> AggregateSnapshot {
        let state = self.lock();
        AggregateSnapshot {
            node: self.node,
            kind: self.kind,
            running_latency: state.in_flight_since.map(|since| since.elapsed()),
            max_latency: state.max_latency,
            violations: state.violations,
            outcomes: state.outcomes.clone(),
        }
    }
}
