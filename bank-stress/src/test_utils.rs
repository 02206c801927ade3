// bank-stress/src/test_utils.rs
// Shared helpers for unit and integration tests.

use crate::config::{ExperimentTimings, HarnessConfig};
use crate::error::StoreError;
use crate::simulation::{SimCluster, SimClusterConfig};
use crate::store::{Connection, Connector, TxStatus};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;

/// Harness config with windows short enough for tests.
pub fn fast_config(node_count: usize) -> HarnessConfig {
    HarnessConfig {
        node_count,
        n_accounts: 100,
        failure_backoff: Duration::from_millis(5),
        connect_timeout: Duration::from_millis(200),
        setup_tries: 5,
        setup_delay: Duration::from_millis(10),
        stop_grace: Duration::from_secs(1),
        timings: ExperimentTimings {
            warming: Duration::from_millis(100),
            duration: Duration::from_millis(400),
            recovery: Duration::from_millis(800),
            settle: Duration::from_millis(50),
            stop_delay: Duration::from_millis(50),
        },
        ..HarnessConfig::default()
    }
}

/// Simulated cluster with sub-millisecond to 1ms statement latency.
pub fn fast_cluster(node_count: usize) -> Arc<SimCluster> {
    SimCluster::new(SimClusterConfig {
        op_min_delay_ms: 0,
        op_max_delay_ms: 1,
        connect_delay_ms: 0,
        commit_delay_ms: 1,
        ..SimClusterConfig::with_nodes(node_count)
    })
}

type Journal = Arc<Mutex<Vec<&'static str>>>;

/// Connector handing out `ScriptedConnection`s. The first
/// `failing_connects` attempts are refused.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    nodes: usize,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    connect_delay: Duration,
    statement_delay: Duration,
    slow_node: Option<usize>,
    totals: Arc<Mutex<VecDeque<i64>>>,
    row_script: Arc<Mutex<VecDeque<u64>>>,
    journal: Journal,
}

impl ScriptedConnector {
    pub fn new(nodes: usize) -> Self {
        ScriptedConnector { nodes, ..Default::default() }
    }

    pub fn failing_connects(self, n: usize) -> Self {
        self.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_statement_delay(mut self, delay: Duration) -> Self {
        self.statement_delay = delay;
        self
    }

    /// Like `with_statement_delay`, but only for connections to `node`.
    pub fn with_slow_node(mut self, node: usize, delay: Duration) -> Self {
        self.slow_node = Some(node);
        self.statement_delay = delay;
        self
    }

    /// Totals returned by `total_balance`, shared by all connections.
    pub fn with_totals(self, totals: Vec<i64>) -> Self {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner) = totals.into();
        self
    }

    /// Row counts returned by successive updates, shared by all connections.
    pub fn with_row_script(self, rows: Vec<u64>) -> Self {
        *self.row_script.lock().unwrap_or_else(PoisonError::into_inner) = rows.into();
        self
    }

    /// Transaction control statements issued on any connection, in order.
    pub fn journal(&self) -> Vec<&'static str> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Connect attempts so far, refused ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn node_count(&self) -> usize {
        self.nodes
    }

    async fn connect(&self, node: usize) -> Result<Box<dyn Connection>, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            sleep(self.connect_delay).await;
        }
        let refused = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StoreError::ConnectFailed { node, reason: "Connection refused".to_string() });
        }
        let delay = match self.slow_node {
            Some(slow) if slow != node => Duration::ZERO,
            _ => self.statement_delay,
        };
        let mut conn = ScriptedConnection::new(node).with_statement_delay(delay);
        conn.totals = Arc::clone(&self.totals);
        conn.row_script = Arc::clone(&self.row_script);
        conn.journal = Arc::clone(&self.journal);
        Ok(Box::new(conn))
    }
}

/// In-memory connection that records what it was asked to do.
#[derive(Debug)]
pub struct ScriptedConnection {
    node: usize,
    rows: u64,
    status: TxStatus,
    statement_delay: Duration,
    slow_node: Option<usize>,
    totals: Arc<Mutex<VecDeque<i64>>>,
    row_script: Arc<Mutex<VecDeque<u64>>>,
    journal: Journal,
    updates: Vec<(u32, i64)>,
    commits: usize,
    rollbacks: usize,
}

impl ScriptedConnection {
    pub fn new(node: usize) -> Self {
        ScriptedConnection {
            node,
            rows: 1,
            status: TxStatus::Idle,
            statement_delay: Duration::ZERO,
            slow_node: None,
            totals: Arc::default(),
            row_script: Arc::default(),
            journal: Arc::default(),
            updates: Vec::new(),
            commits: 0,
            rollbacks: 0,
        }
    }

    /// Row count reported by updates once the row script is exhausted.
    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = rows;
        self
    }

    /// Totals returned by successive `total_balance` calls; 0 once exhausted.
    pub fn with_totals(self, totals: Vec<i64>) -> Self {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner) = totals.into();
        self
    }

    pub fn with_statement_delay(mut self, delay: Duration) -> Self {
        self.statement_delay = delay;
        self
    }

    pub fn updates(&self) -> &[(u32, i64)] {
        &self.updates
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }

    fn log(&self, statement: &'static str) {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner).push(statement);
    }

    async fn statement(&self) {
        if self.statement_delay.is_zero() {
            yield_now().await;
        } else {
            sleep(self.statement_delay).await;
        }
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn node(&self) -> usize {
        self.node
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn transaction_status(&self) -> TxStatus {
        self.status
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.statement().await;
        self.log("begin");
        self.status = TxStatus::InTransaction;
        Ok(())
    }

    async fn add_to_balance(&mut self, uid: u32, delta: i64) -> Result<u64, StoreError> {
        self.statement().await;
        self.updates.push((uid, delta));
        let scripted = self.row_script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        Ok(scripted.unwrap_or(self.rows))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.statement().await;
        if self.status != TxStatus::InTransaction {
            return Err(StoreError::NoTransaction);
        }
        self.log("commit");
        self.status = TxStatus::Idle;
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.log("rollback");
        self.status = TxStatus::Idle;
        self.rollbacks += 1;
        Ok(())
    }

    async fn total_balance(&mut self) -> Result<i64, StoreError> {
        self.statement().await;
        let next = self.totals.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        Ok(next.unwrap_or(0))
    }

    async fn create_accounts(&mut self, _n_accounts: u32) -> Result<(), StoreError> {
        Ok(())
    }

    async fn data_digest(&mut self) -> Result<String, StoreError> {
        Ok("scripted".to_string())
    }

    async fn prepared_count(&mut self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
