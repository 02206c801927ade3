// One workload loop per (node, kind): connect, run a transaction, record
// the outcome, repeat until the running flag goes down.

use crate::aggregate::{OutcomeAggregate, COMMIT};
use crate::config::HarnessConfig;
use crate::error::StoreError;
use crate::registry::AggregationRegistry;
use crate::store::{Connection, Connector, TxStatus};
use crate::workload::{TxBody, TxKind};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

/// Timing knobs of a loop, taken from the harness config.
#[derive(Clone, Copy, Debug)]
pub struct LoopSettings {
    pub failure_backoff: Duration,
    pub connect_timeout: Duration,
}

impl From<&HarnessConfig> for LoopSettings {
    fn from(config: &HarnessConfig) -> Self {
        LoopSettings {
            failure_backoff: config.failure_backoff,
            connect_timeout: config.connect_timeout,
        }
    }
}

pub struct WorkloadLoop {
    node: usize,
    body: TxBody,
    connector: Arc<dyn Connector>,
    conn: Option<Box<dyn Connection>>,
    aggregate: Arc<OutcomeAggregate>,
    settings: LoopSettings,
    running: watch::Receiver<bool>,
    state: LoopState,
}

impl WorkloadLoop {
    /// Creates the loop and registers its aggregate under `(node, body.kind())`.
    pub fn new(
        node: usize,
        body: TxBody,
        connector: Arc<dyn Connector>,
        registry: &AggregationRegistry,
        settings: LoopSettings,
        running: watch::Receiver<bool>,
    ) -> Self {
        let aggregate = registry.register(node, body.kind());
        WorkloadLoop {
            node,
            body,
            connector,
            conn: None,
            aggregate,
            settings,
            running,
            state: LoopState::Running,
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn kind(&self) -> TxKind {
        self.body.kind()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Runs until stopped and returns the number of completed iterations.
    pub async fn run(mut self) -> u64 {
        info!("Starting {} loop on node {}", self.kind(), self.node + 1);
        let mut iterations = 0u64;
        while self.poll_running() == LoopState::Running {
            self.iterate().await;
            iterations += 1;
        }
        info!(
            "{} loop on node {} stopped after {} iterations",
            self.kind(),
            self.node + 1,
            iterations
        );
        iterations
    }

    // A dropped sender counts as a stop request too.
    fn poll_running(&mut self) -> LoopState {
        let closed = self.running.has_changed().is_err();
        let running = *self.running.borrow();
        if closed || !running {
            self.state = LoopState::Stopped;
        }
        self.state
    }

    /// One iteration: exactly one outcome is recorded per call.
    pub async fn iterate(&mut self) {
        let started = self.aggregate.start_tx();
        match self.step().await {
            Ok(true) => self.aggregate.finish_tx_with_violation(started, COMMIT),
            Ok(false) => self.aggregate.finish_tx(started, COMMIT),
            Err(err) => {
                match &err {
                    StoreError::Query(_) | StoreError::InFailedTransaction | StoreError::NoTransaction => {
                        debug!("{} on node {}: {}", self.kind(), self.node + 1, err)
                    }
                    _ => warn!("Caught exception in {} on node {}: {}", self.kind(), self.node + 1, err),
                }
                self.aggregate.finish_tx(started, &err.to_string());
                if self.conn.as_ref().map_or(false, |c| c.is_closed()) {
                    self.conn = None;
                }
                sleep(self.settings.failure_backoff).await;
            }
        }
    }

    async fn step(&mut self) -> Result<bool, StoreError> {
        if self.conn.as_ref().map_or(true, |c| c.is_closed()) {
            self.conn = None;
            let conn = match timeout(self.settings.connect_timeout, self.connector.connect(self.node)).await {
                Ok(conn) => conn?,
                Err(_) => {
                    return Err(StoreError::ConnectFailed {
                        node: self.node,
                        reason: "timeout expired".to_string(),
                    })
                }
            };
            info!("Connected {}, {}", self.kind(), self.node + 1);
            self.conn = Some(conn);
        }
        let conn = self.conn.as_mut().ok_or(StoreError::ConnectionClosed)?;
        if conn.transaction_status() != TxStatus::Idle {
            conn.rollback().await?;
        }
        self.body.execute(conn.as_mut()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedConnector;

    fn settings() -> LoopSettings {
        LoopSettings {
            failure_backoff: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn failed_connect_is_recorded_then_retried() {
        let connector = Arc::new(ScriptedConnector::new(1).failing_connects(2));
        let registry = AggregationRegistry::new();
        let (_tx, rx) = watch::channel(true);
        let mut wl = WorkloadLoop::new(0, TxBody::sum_total(0), connector.clone(), &registry, settings(), rx);

        for _ in 0..4 {
            wl.iterate().await;
        }
        let snap = registry.snapshot_and_clear();
        let agg = snap.sumtotal(0).unwrap();
        assert_eq!(agg.total(), 4);
        assert_eq!(agg.commits(), 2);
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn connect_timeout_becomes_an_outcome() {
        let connector = Arc::new(ScriptedConnector::new(1).with_connect_delay(Duration::from_millis(200)));
        let registry = AggregationRegistry::new();
        let (_tx, rx) = watch::channel(true);
        let mut wl = WorkloadLoop::new(0, TxBody::transfer(10, 1), connector, &registry, settings(), rx);
        wl.iterate().await;
        let snap = registry.snapshot_and_clear();
        let outcomes = &snap.transfer(0).unwrap().outcomes;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes.keys().next().unwrap().contains("timeout expired"));
    }

    #[tokio::test]
    async fn failed_transfer_is_rolled_back_before_the_next_one() {
        let connector = Arc::new(ScriptedConnector::new(1).with_row_script(vec![0]));
        let registry = AggregationRegistry::new();
        let (_tx, rx) = watch::channel(true);
        let mut wl = WorkloadLoop::new(0, TxBody::transfer(10, 1), connector.clone(), &registry, settings(), rx);

        wl.iterate().await;
        assert_eq!(connector.journal(), vec!["begin"]);
        wl.iterate().await;
        assert_eq!(connector.journal(), vec!["begin", "rollback", "begin", "commit"]);

        let snap = registry.snapshot_and_clear();
        let agg = snap.transfer(0).unwrap();
        assert_eq!(agg.total(), 2);
        assert_eq!(agg.commits(), 1);
        assert!(agg.outcomes.keys().any(|label| label.ends_with("affected 0 rows, expected 1")));
    }

    #[tokio::test]
    async fn violation_is_reported_with_its_commit() {
        let connector = Arc::new(ScriptedConnector::new(1).with_totals(vec![0, 7, 7]));
        let registry = AggregationRegistry::new();
        let (_tx, rx) = watch::channel(true);
        let mut wl = WorkloadLoop::new(0, TxBody::sum_total(0), connector, &registry, settings(), rx);

        wl.iterate().await;
        wl.iterate().await;
        let snap = registry.snapshot_and_clear();
        assert_eq!(snap.violations(0), 1);
        assert_eq!(snap.sumtotal(0).unwrap().commits(), 2);

        wl.iterate().await;
        let snap = registry.snapshot_and_clear();
        assert_eq!(snap.violations(0), 0);
        assert_eq!(snap.sumtotal(0).unwrap().commits(), 1);
    }

    #[tokio::test]
    async fn stops_when_flag_goes_down() {
        let connector = Arc::new(ScriptedConnector::new(1));
        let registry = AggregationRegistry::new();
        let (tx, rx) = watch::channel(true);
        let wl = WorkloadLoop::new(0, TxBody::transfer(10, 1), connector, &registry, settings(), rx);
        let handle = tokio::spawn(wl.run());
        sleep(Duration::from_millis(20)).await;
        tx.send(false).unwrap();
        let iterations = handle.await.unwrap();
        assert!(iterations > 0);
        let snap = registry.snapshot_and_clear();
        assert_eq!(snap.transfer(0).unwrap().total(), iterations);
    }

    #[tokio::test]
    async fn dropped_sender_stops_the_loop() {
        let connector = Arc::new(ScriptedConnector::new(1));
        let registry = AggregationRegistry::new();
        let (tx, rx) = watch::channel(true);
        let mut wl = WorkloadLoop::new(0, TxBody::sum_total(0), connector, &registry, settings(), rx);
        assert_eq!(wl.poll_running(), LoopState::Running);
        drop(tx);
        assert_eq!(wl.poll_running(), LoopState::Stopped);
    }
}
