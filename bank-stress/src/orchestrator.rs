// Runs one failure experiment against a running workload and checks the
// aggregates it produced.

use crate::client::BankClient;
use crate::config::ExperimentTimings;
use crate::error::{AssertionFailure, HarnessError};
use crate::failure::FailureInjector;
use crate::registry::Snapshot;
use chrono::Utc;
use log::info;
use tokio::time::sleep;

/// Aggregates of the two measurement windows of an experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowResults {
    pub during_failure: Snapshot,
    pub after_recovery: Snapshot,
}

pub struct Experiment<'a> {
    client: &'a mut BankClient,
    timings: ExperimentTimings,
}

impl<'a> Experiment<'a> {
    pub fn new(client: &'a mut BankClient) -> Self {
        let timings = client.config().timings.clone();
        Experiment { client, timings }
    }

    pub fn with_timings(client: &'a mut BankClient, timings: ExperimentTimings) -> Self {
        Experiment { client, timings }
    }

    /// Warms up, injects `failure` for one window, removes it and measures
    /// one more window.
    pub async fn perform_failure(&mut self, failure: &dyn FailureInjector) -> Result<WindowResults, HarnessError> {
        let name = failure.name();
        sleep(self.timings.warming).await;

        failure.start().await?;
        info!("Simulate {} at {}", name, Utc::now().to_rfc3339());
        self.client.clean_aggregates().await?;
        sleep(self.timings.duration).await;
        let during_failure = self.client.get_aggregates().await?;

        failure.stop().await?;
        info!("Stop {} at {}", name, Utc::now().to_rfc3339());
        self.client.clean_aggregates().await?;
        sleep(self.timings.recovery).await;
        let after_recovery = self.client.get_aggregates().await?;

        Ok(WindowResults { during_failure, after_recovery })
    }
}

fn transfer_commits(snapshot: &Snapshot, node: usize) -> Result<bool, AssertionFailure> {
    snapshot
        .transfer(node)
        .map(|agg| agg.has_commits())
        .ok_or(AssertionFailure::MissingNode { node })
}

/// Every listed node committed at least one transfer.
pub fn assert_commits(snapshot: &Snapshot, nodes: &[usize]) -> Result<(), AssertionFailure> {
    for &node in nodes {
        if !transfer_commits(snapshot, node)? {
            return Err(AssertionFailure::NoCommits { node });
        }
    }
    Ok(())
}

/// No listed node committed a transfer.
pub fn assert_no_commits(snapshot: &Snapshot, nodes: &[usize]) -> Result<(), AssertionFailure> {
    for &node in nodes {
        if transfer_commits(snapshot, node)? {
            return Err(AssertionFailure::UnexpectedCommits { node });
        }
    }
    Ok(())
}

/// At least one of the listed nodes committed a transfer.
pub fn assert_any_commits(snapshot: &Snapshot, nodes: &[usize]) -> Result<(), AssertionFailure> {
    let mut first_missing = None;
    for &node in nodes {
        if transfer_commits(snapshot, node)? {
            return Ok(());
        }
        first_missing.get_or_insert(node);
    }
    Err(AssertionFailure::NoCommits { node: first_missing.unwrap_or_default() })
}

/// No listed node observed a change of the conserved total.
pub fn assert_isolation(snapshot: &Snapshot, nodes: &[usize]) -> Result<(), AssertionFailure> {
    for &node in nodes {
        if snapshot.sumtotal(node).is_none() {
            return Err(AssertionFailure::MissingNode { node });
        }
        let violations = snapshot.violations(node);
        if violations > 0 {
            return Err(AssertionFailure::Isolation { node, violations });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::COMMIT;
    use crate::registry::AggregationRegistry;
    use crate::workload::TxKind;
    use std::time::Duration;

    fn sample() -> Snapshot {
        let registry = AggregationRegistry::new();
        for node in 0..3 {
            registry.register(node, TxKind::Transfer);
            registry.register(node, TxKind::SumTotal);
        }
        registry.register(0, TxKind::Transfer).append(COMMIT, Duration::from_millis(1));
        registry.register(1, TxKind::Transfer).append(COMMIT, Duration::from_millis(1));
        registry.register(2, TxKind::Transfer).append("could not connect", Duration::from_millis(1));
        registry.register(2, TxKind::SumTotal).record_violation();
        registry.snapshot_and_clear()
    }

    #[test]
    fn commit_assertions() {
        let snap = sample();
        assert_eq!(assert_commits(&snap, &[0, 1]), Ok(()));
        assert_eq!(assert_commits(&snap, &[0, 2]), Err(AssertionFailure::NoCommits { node: 2 }));
        assert_eq!(assert_no_commits(&snap, &[2]), Ok(()));
        assert_eq!(assert_no_commits(&snap, &[1]), Err(AssertionFailure::UnexpectedCommits { node: 1 }));
        assert_eq!(assert_any_commits(&snap, &[2, 1]), Ok(()));
        assert_eq!(assert_commits(&snap, &[5]), Err(AssertionFailure::MissingNode { node: 5 }));
    }

    #[test]
    fn isolation_assertion() {
        let snap = sample();
        assert_eq!(assert_isolation(&snap, &[0, 1]), Ok(()));
        assert_eq!(
            assert_isolation(&snap, &[0, 1, 2]),
            Err(AssertionFailure::Isolation { node: 2, violations: 1 })
        );
    }
}
