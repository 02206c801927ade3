// In-process multi-master bank cluster.
//
// Every node keeps a full replica of the accounts table. A node serves
// statements only while its replica is fresh; a commit needs a majority of
// up nodes reachable from the committing node and is applied, in one locked
// step, to every fresh node of that component. Every other node is marked
// stale and copies a fresh replica before serving again. Fresh replicas are
// therefore always identical.

use crate::error::{HarnessError, StoreError};
use crate::failure::FaultTarget;
use crate::simulation::config::SimClusterConfig;
use crate::simulation::connection::SimConnector;
use crate::simulation::network::{LatencyModel, LinkTable};
use async_trait::async_trait;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct NodeState {
    up: bool,
    stale: bool,
    // Bumped on every stop; sessions opened under an older epoch are dead
    epoch: u64,
    accounts: BTreeMap<u32, i64>,
    // Global ids of prepared, not yet resolved transactions
    prepared: HashSet<String>,
}

impl NodeState {
    fn new() -> Self {
        NodeState {
            up: true,
            stale: false,
            epoch: 0,
            accounts: BTreeMap::new(),
            prepared: HashSet::new(),
        }
    }
}

#[derive(Debug)]
struct ClusterState {
    nodes: Vec<NodeState>,
    links: LinkTable,
}

impl ClusterState {
    fn reachable(&self, node: usize) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&peer| self.nodes[peer].up && self.links.connected(node, peer))
            .collect()
    }
}

#[derive(Debug)]
pub struct SimCluster {
    config: SimClusterConfig,
    latency: LatencyModel,
    state: Mutex<ClusterState>,
    next_xid: AtomicU64,
}

fn abort_error(node: usize, gid: &str, xid: u64, reason: &str) -> StoreError {
    StoreError::Query(format!(
        "Transaction {} (node {}, xid {}) is aborted on node {}: {}",
        gid,
        node + 1,
        xid,
        node + 1,
        reason
    ))
}

impl SimCluster {
    pub fn new(config: SimClusterConfig) -> Arc<Self> {
        let latency = LatencyModel {
            min_ms: config.op_min_delay_ms,
            max_ms: config.op_max_delay_ms,
        };
        let state = ClusterState {
            nodes: (0..config.node_count).map(|_| NodeState::new()).collect(),
            links: LinkTable::new(config.node_count),
        };
        info!("[SimCluster] Created cluster with {} nodes", config.node_count);
        Arc::new(SimCluster {
            config,
            latency,
            state: Mutex::new(state),
            next_xid: AtomicU64::new(1),
        })
    }

    pub fn connector(self: &Arc<Self>) -> SimConnector {
        SimConnector::new(Arc::clone(self))
    }

    pub fn config(&self) -> &SimClusterConfig {
        &self.config
    }

    pub fn node_count(&self) -> usize {
        self.config.node_count
    }

    pub(crate) fn latency(&self) -> LatencyModel {
        self.latency
    }

    pub(crate) fn next_xid(&self) -> u64 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Session level ---

    /// Opens a session on `node` and returns the node epoch it is bound to.
    pub(crate) fn open_session(&self, node: usize) -> Result<u64, StoreError> {
        let state = self.lock();
        match state.nodes.get(node) {
            None => Err(StoreError::ConnectFailed {
                node,
                reason: "no such node".to_string(),
            }),
            Some(n) if !n.up => Err(StoreError::ConnectFailed {
                node,
                reason: "Connection refused".to_string(),
            }),
            Some(n) => Ok(n.epoch),
        }
    }

    fn check_session(state: &ClusterState, node: usize, epoch: u64) -> Result<(), StoreError> {
        match state.nodes.get(node) {
            Some(n) if n.up && n.epoch == epoch => Ok(()),
            _ => Err(StoreError::ConnectionClosed),
        }
    }

    fn has_quorum(&self, state: &ClusterState, node: usize) -> bool {
        state.reachable(node).len() >= self.config.quorum()
    }

    /// Resynchronizes a stale replica from a fresh reachable donor.
    fn ensure_fresh(&self, state: &mut ClusterState, node: usize) -> Result<(), StoreError> {
        if !state.nodes[node].stale {
            return Ok(());
        }
        if !self.has_quorum(state, node) {
            return Err(StoreError::Query(format!(
                "node {} is in recovery: no quorum to resynchronize",
                node + 1
            )));
        }
        let donor = state
            .reachable(node)
            .into_iter()
            .find(|&peer| peer != node && !state.nodes[peer].stale);
        match donor {
            Some(donor) => {
                let accounts = state.nodes[donor].accounts.clone();
                let target = &mut state.nodes[node];
                target.accounts = accounts;
                target.stale = false;
                info!("[SimCluster] Node {} resynchronized from node {}", node + 1, donor + 1);
                Ok(())
            }
            None => Err(StoreError::Query(format!(
                "node {} is in recovery: no fresh donor reachable",
                node + 1
            ))),
        }
    }

    /// Applies a change to every fresh node reachable from `origin` and marks
    /// every other node stale.
    fn replicate(state: &mut ClusterState, origin: usize, apply: impl Fn(&mut BTreeMap<u32, i64>)) {
        let reachable: HashSet<usize> = state.reachable(origin).into_iter().collect();
        for (idx, node) in state.nodes.iter_mut().enumerate() {
            if reachable.contains(&idx) && !node.stale {
                apply(&mut node.accounts);
            } else if !node.stale {
                debug!("[SimCluster] Node {} missed a change from node {}, marking stale", idx + 1, origin + 1);
                node.stale = true;
            }
        }
    }

    // --- Statements ---

    pub(crate) fn row_exists(&self, node: usize, epoch: u64, uid: u32) -> Result<bool, StoreError> {
        let mut state = self.lock();
        Self::check_session(&state, node, epoch)?;
        self.ensure_fresh(&mut state, node)?;
        Ok(state.nodes[node].accounts.contains_key(&uid))
    }

    pub(crate) fn total(&self, node: usize, epoch: u64) -> Result<i64, StoreError> {
        let mut state = self.lock();
        Self::check_session(&state, node, epoch)?;
        self.ensure_fresh(&mut state, node)?;
        Ok(state.nodes[node].accounts.values().sum())
    }

    /// First phase of a commit: registers `gid` as prepared on `node`.
    pub(crate) fn prepare(&self, node: usize, epoch: u64, gid: &str, xid: u64) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_session(&state, node, epoch)?;
        self.ensure_fresh(&mut state, node)?;
        if !self.has_quorum(&state, node) {
            return Err(abort_error(node, gid, xid, "cluster has no quorum"));
        }
        state.nodes[node].prepared.insert(gid.to_string());
        Ok(())
    }

    /// Second phase: applies `writes` cluster-wide, or aborts if the quorum
    /// was lost since the prepare.
    pub(crate) fn commit_prepared(
        &self,
        node: usize,
        epoch: u64,
        gid: &str,
        xid: u64,
        writes: &[(u32, i64)],
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        // If the node went down the prepared entry stays in doubt until restart.
        Self::check_session(&state, node, epoch)?;
        state.nodes[node].prepared.remove(gid);
        if state.nodes[node].stale || !self.has_quorum(&state, node) {
            return Err(abort_error(node, gid, xid, "cluster lost quorum during commit"));
        }
        Self::replicate(&mut state, node, |accounts| {
            for (uid, delta) in writes {
                if let Some(balance) = accounts.get_mut(uid) {
                    *balance += delta;
                }
            }
        });
        Ok(())
    }

    pub(crate) fn abort_prepared(&self, node: usize, gid: &str) {
        let mut state = self.lock();
        if let Some(n) = state.nodes.get_mut(node) {
            n.prepared.remove(gid);
        }
    }

    pub(crate) fn create_accounts(&self, node: usize, epoch: u64, n_accounts: u32) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_session(&state, node, epoch)?;
        self.ensure_fresh(&mut state, node)?;
        if !self.has_quorum(&state, node) {
            return Err(StoreError::Query(format!(
                "node {} is not online: cluster has no quorum",
                node + 1
            )));
        }
        Self::replicate(&mut state, node, |accounts| {
            accounts.clear();
            accounts.extend((0..=n_accounts).map(|uid| (uid, 0)));
        });
        info!("[SimCluster] Created accounts table with {} rows via node {}", n_accounts as u64 + 1, node + 1);
        Ok(())
    }

    pub(crate) fn digest(&self, node: usize, epoch: u64) -> Result<String, StoreError> {
        let mut state = self.lock();
        Self::check_session(&state, node, epoch)?;
        self.ensure_fresh(&mut state, node)?;
        let mut hasher = Sha256::new();
        for (uid, amount) in &state.nodes[node].accounts {
            hasher.update(format!("({}, {}),", uid, amount).as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    pub(crate) fn prepared_on(&self, node: usize, epoch: u64) -> Result<usize, StoreError> {
        let state = self.lock();
        Self::check_session(&state, node, epoch)?;
        Ok(state.nodes[node].prepared.len())
    }

    // --- Inspection (bypasses sessions, for checks and tests) ---

    /// Sum of balances stored on `node`, whatever its state.
    pub fn node_total(&self, node: usize) -> Option<i64> {
        self.lock().nodes.get(node).map(|n| n.accounts.values().sum())
    }

    pub fn node_rows(&self, node: usize) -> Option<usize> {
        self.lock().nodes.get(node).map(|n| n.accounts.len())
    }

    pub fn is_up(&self, node: usize) -> bool {
        self.lock().nodes.get(node).map(|n| n.up).unwrap_or(false)
    }

    pub fn is_stale(&self, node: usize) -> bool {
        self.lock().nodes.get(node).map(|n| n.stale).unwrap_or(false)
    }

    fn check_index(&self, node: usize, scenario: &str) -> Result<(), HarnessError> {
        if node < self.config.node_count {
            Ok(())
        } else {
            Err(HarnessError::Injection {
                scenario: scenario.to_string(),
                reason: format!("no node with index {}", node),
            })
        }
    }

    fn stop_node(&self, node: usize, crash: bool) {
        let mut state = self.lock();
        let n = &mut state.nodes[node];
        n.up = false;
        n.epoch += 1;
        if crash {
            // Unflushed state is gone; the replica must be rebuilt on start.
            n.stale = true;
        } else {
            n.prepared.clear();
        }
    }
}

#[async_trait]
impl FaultTarget for SimCluster {
    async fn isolate(&self, node: usize) -> Result<(), HarnessError> {
        self.check_index(node, "isolate")?;
        self.lock().links.isolate(node);
        info!("[SimCluster] Node {} isolated", node + 1);
        Ok(())
    }

    async fn heal(&self, node: usize) -> Result<(), HarnessError> {
        self.check_index(node, "heal")?;
        self.lock().links.heal(node);
        info!("[SimCluster] Node {} healed", node + 1);
        Ok(())
    }

    async fn cut_link(&self, a: usize, b: usize) -> Result<(), HarnessError> {
        self.check_index(a, "cut_link")?;
        self.check_index(b, "cut_link")?;
        self.lock().links.cut(a, b);
        info!("[SimCluster] Link {} <-> {} cut", a + 1, b + 1);
        Ok(())
    }

    async fn restore_link(&self, a: usize, b: usize) -> Result<(), HarnessError> {
        self.check_index(a, "restore_link")?;
        self.check_index(b, "restore_link")?;
        self.lock().links.restore(a, b);
        info!("[SimCluster] Link {} <-> {} restored", a + 1, b + 1);
        Ok(())
    }

    async fn crash(&self, node: usize) -> Result<(), HarnessError> {
        self.check_index(node, "crash")?;
        self.stop_node(node, true);
        warn!("[SimCluster] Node {} killed", node + 1);
        Ok(())
    }

    async fn shutdown(&self, node: usize) -> Result<(), HarnessError> {
        self.check_index(node, "shutdown")?;
        self.stop_node(node, false);
        info!("[SimCluster] Node {} stopped", node + 1);
        Ok(())
    }

    async fn start(&self, node: usize) -> Result<(), HarnessError> {
        self.check_index(node, "start")?;
        let mut state = self.lock();
        let n = &mut state.nodes[node];
        if !n.prepared.is_empty() {
            info!("[SimCluster] Node {} rolled back {} in-doubt transactions during recovery", node + 1, n.prepared.len());
            n.prepared.clear();
        }
        n.up = true;
        info!("[SimCluster] Node {} started", node + 1);
        Ok(())
    }
}
