use crate::error::StoreError;
use crate::simulation::cluster::SimCluster;
use crate::store::{Connection, Connector, TxStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// `Connector` over a `SimCluster`.
#[derive(Clone, Debug)]
pub struct SimConnector {
    cluster: Arc<SimCluster>,
}

impl SimConnector {
    pub fn new(cluster: Arc<SimCluster>) -> Self {
        SimConnector { cluster }
    }

    pub fn cluster(&self) -> &Arc<SimCluster> {
        &self.cluster
    }
}

#[async_trait]
impl Connector for SimConnector {
    fn node_count(&self) -> usize {
        self.cluster.node_count()
    }

    async fn connect(&self, node: usize) -> Result<Box<dyn Connection>, StoreError> {
        let delay = self.cluster.config().connect_delay_ms;
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        let epoch = self.cluster.open_session(node)?;
        Ok(Box::new(SimConnection {
            cluster: Arc::clone(&self.cluster),
            node,
            epoch,
            status: TxStatus::Idle,
            closed: false,
            writes: Vec::new(),
        }))
    }
}

/// A session on one simulated node. Updates are buffered until commit.
#[derive(Debug)]
pub struct SimConnection {
    cluster: Arc<SimCluster>,
    node: usize,
    epoch: u64,
    status: TxStatus,
    closed: bool,
    writes: Vec<(u32, i64)>,
}

impl SimConnection {
    // Updates session state the way a server would after a failed statement.
    fn fail(&mut self, err: StoreError) -> StoreError {
        match err {
            StoreError::ConnectionClosed | StoreError::ConnectFailed { .. } => {
                self.closed = true;
            }
            _ if self.status == TxStatus::InTransaction => {
                self.status = TxStatus::InError;
            }
            _ => {}
        }
        err
    }

    fn usable(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::ConnectionClosed);
        }
        if self.status == TxStatus::InError {
            return Err(StoreError::InFailedTransaction);
        }
        Ok(())
    }

    async fn round_trip(&self) {
        self.cluster.latency().delay().await;
    }
}

#[async_trait]
impl Connection for SimConnection {
    fn node(&self) -> usize {
        self.node
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn transaction_status(&self) -> TxStatus {
        self.status
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.usable()?;
        self.round_trip().await;
        self.cluster
            .row_exists(self.node, self.epoch, 0)
            .map_err(|e| self.fail(e))?;
        self.writes.clear();
        self.status = TxStatus::InTransaction;
        Ok(())
    }

    async fn add_to_balance(&mut self, uid: u32, delta: i64) -> Result<u64, StoreError> {
        self.usable()?;
        self.round_trip().await;
        let exists = self
            .cluster
            .row_exists(self.node, self.epoch, uid)
            .map_err(|e| self.fail(e))?;
        if !exists {
            return Ok(0);
        }
        if self.status == TxStatus::InTransaction {
            self.writes.push((uid, delta));
            Ok(1)
        } else {
            // autocommit
            let writes = [(uid, delta)];
            self.commit_writes(&writes).await.map(|_| 1)
        }
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::ConnectionClosed);
        }
        match self.status {
            TxStatus::Idle => return Err(StoreError::NoTransaction),
            TxStatus::InError => {
                // the server turns COMMIT of a failed block into ROLLBACK
                self.status = TxStatus::Idle;
                self.writes.clear();
                return Err(StoreError::InFailedTransaction);
            }
            TxStatus::InTransaction => {}
        }
        let writes = std::mem::take(&mut self.writes);
        let result = self.commit_writes(&writes).await;
        if !self.closed {
            self.status = TxStatus::Idle;
        }
        result
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::ConnectionClosed);
        }
        self.round_trip().await;
        self.writes.clear();
        self.status = TxStatus::Idle;
        Ok(())
    }

    async fn total_balance(&mut self) -> Result<i64, StoreError> {
        self.usable()?;
        self.round_trip().await;
        self.cluster.total(self.node, self.epoch).map_err(|e| self.fail(e))
    }

    async fn create_accounts(&mut self, n_accounts: u32) -> Result<(), StoreError> {
        self.usable()?;
        self.round_trip().await;
        self.cluster
            .create_accounts(self.node, self.epoch, n_accounts)
            .map_err(|e| self.fail(e))
    }

    async fn data_digest(&mut self) -> Result<String, StoreError> {
        self.usable()?;
        self.round_trip().await;
        self.cluster.digest(self.node, self.epoch).map_err(|e| self.fail(e))
    }

    async fn prepared_count(&mut self) -> Result<usize, StoreError> {
        self.usable()?;
        self.round_trip().await;
        self.cluster.prepared_on(self.node, self.epoch).map_err(|e| self.fail(e))
    }
}

impl SimConnection {
    // Two-phase commit with a suspension point between prepare and commit.
    async fn commit_writes(&mut self, writes: &[(u32, i64)]) -> Result<(), StoreError> {
        let xid = self.cluster.next_xid();
        let gid = format!("MTM-{}-{}-{}", self.node, xid, self.epoch);
        self.round_trip().await;
        self.cluster
            .prepare(self.node, self.epoch, &gid, xid)
            .map_err(|e| self.fail(e))?;
        let delay = self.cluster.config().commit_delay_ms;
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        let result = if self.cluster.config().torn_commits {
            self.commit_torn(&gid, xid, writes).await
        } else {
            self.cluster.commit_prepared(self.node, self.epoch, &gid, xid, writes)
        };
        if let Err(StoreError::Query(_)) = &result {
            self.cluster.abort_prepared(self.node, &gid);
        }
        result.map_err(|e| self.fail(e))
    }

    async fn commit_torn(&self, gid: &str, xid: u64, writes: &[(u32, i64)]) -> Result<(), StoreError> {
        for (idx, write) in writes.iter().enumerate() {
            if idx > 0 {
                self.round_trip().await;
            }
            self.cluster
                .commit_prepared(self.node, self.epoch, gid, xid, std::slice::from_ref(write))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FaultTarget;
    use crate::simulation::config::SimClusterConfig;

    async fn seeded(nodes: usize) -> (Arc<SimCluster>, SimConnector) {
        let cluster = SimCluster::new(SimClusterConfig::with_nodes(nodes));
        let connector = cluster.connector();
        let mut conn = connector.connect(0).await.unwrap();
        conn.create_accounts(10).await.unwrap();
        (cluster, connector)
    }

    #[tokio::test]
    async fn buffered_transfer_commits_everywhere() {
        let (cluster, connector) = seeded(3).await;
        let mut conn = connector.connect(1).await.unwrap();
        conn.begin().await.unwrap();
        assert_eq!(conn.transaction_status(), TxStatus::InTransaction);
        assert_eq!(conn.add_to_balance(4, -1).await.unwrap(), 1);
        assert_eq!(conn.add_to_balance(5, 1).await.unwrap(), 1);
        conn.commit().await.unwrap();
        assert_eq!(conn.transaction_status(), TxStatus::Idle);
        for node in 0..3 {
            assert_eq!(cluster.node_total(node), Some(0));
        }
    }

    #[tokio::test]
    async fn missing_row_reports_zero_rows() {
        let (_cluster, connector) = seeded(3).await;
        let mut conn = connector.connect(0).await.unwrap();
        conn.begin().await.unwrap();
        assert_eq!(conn.add_to_balance(99, 1).await.unwrap(), 0);
        conn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn failed_statement_leaves_transaction_in_error() {
        let (cluster, connector) = seeded(3).await;
        let mut conn = connector.connect(2).await.unwrap();
        cluster.isolate(2).await.unwrap();
        // make node 3 stale so its statements fail
        let mut other = connector.connect(0).await.unwrap();
        other.begin().await.unwrap();
        other.add_to_balance(1, 1).await.unwrap();
        other.add_to_balance(2, -1).await.unwrap();
        other.commit().await.unwrap();

        assert!(conn.begin().await.is_err());
        assert_eq!(conn.transaction_status(), TxStatus::Idle);

        cluster.heal(2).await.unwrap();
        conn.begin().await.unwrap();
        cluster.isolate(2).await.unwrap();
        other.begin().await.unwrap();
        other.add_to_balance(1, 1).await.unwrap();
        other.commit().await.unwrap();
        assert!(conn.add_to_balance(3, 1).await.is_err());
        assert_eq!(conn.transaction_status(), TxStatus::InError);
        assert_eq!(conn.add_to_balance(3, 1).await, Err(StoreError::InFailedTransaction));
        conn.rollback().await.unwrap();
        assert_eq!(conn.transaction_status(), TxStatus::Idle);
    }

    #[tokio::test]
    async fn torn_commits_expose_partial_state() {
        let config = SimClusterConfig {
            op_min_delay_ms: 20,
            op_max_delay_ms: 20,
            torn_commits: true,
            ..SimClusterConfig::with_nodes(3)
        };
        let cluster = SimCluster::new(config);
        let connector = cluster.connector();
        connector.connect(0).await.unwrap().create_accounts(10).await.unwrap();

        let writer = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let mut conn = connector.connect(0).await.unwrap();
                conn.begin().await.unwrap();
                conn.add_to_balance(1, -1).await.unwrap();
                conn.add_to_balance(2, 1).await.unwrap();
                conn.commit().await.unwrap();
            })
        };
        let mut seen_partial = false;
        while !writer.is_finished() {
            if cluster.node_total(1) != Some(0) {
                seen_partial = true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        writer.await.unwrap();
        assert!(seen_partial);
        assert_eq!(cluster.node_total(1), Some(0));
    }

    #[tokio::test]
    async fn restart_closes_open_connection() {
        let (cluster, connector) = seeded(3).await;
        let mut conn = connector.connect(1).await.unwrap();
        cluster.shutdown(1).await.unwrap();
        assert_eq!(conn.total_balance().await, Err(StoreError::ConnectionClosed));
        assert!(conn.is_closed());
        assert!(connector.connect(1).await.is_err());
        cluster.start(1).await.unwrap();
        let mut conn = connector.connect(1).await.unwrap();
        assert_eq!(conn.total_balance().await.unwrap(), 0);
    }
}
