// Controller-side handle on a running bank workload.

use crate::config::HarnessConfig;
use crate::control::ControlChannel;
use crate::error::{HarnessError, StoreError};
use crate::registry::Snapshot;
use crate::store::Connector;
use crate::worker::{self, WorkerHandle, WorkerReport};
use log::{info, warn};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Runs `op` up to `tries` times, sleeping `delay` between attempts.
pub async fn keep_trying<T, F, Fut>(
    tries: usize,
    delay: Duration,
    name: &str,
    mut op: F,
) -> Result<T, HarnessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    if tries == 0 {
        return Err(HarnessError::Config(format!("{} needs at least one try", name)));
    }
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(source) if attempt >= tries => {
                return Err(HarnessError::SetupExhausted {
                    name: name.to_string(),
                    tries,
                    source,
                })
            }
            Err(e) => {
                warn!("{} failed [{} of {}]: {}", name, attempt, tries, e);
                attempt += 1;
                sleep(delay).await;
            }
        }
    }
}

pub struct BankClient {
    config: HarnessConfig,
    connector: Arc<dyn Connector>,
    control: Option<ControlChannel>,
    worker: Option<WorkerHandle>,
}

impl BankClient {
    /// Validates the config and (re)creates the accounts table through the
    /// first node, retrying while the cluster comes up.
    pub async fn new(config: HarnessConfig, connector: Arc<dyn Connector>) -> Result<Self, HarnessError> {
        config.validate()?;
        if connector.node_count() == 0 {
            return Err(HarnessError::Config("connector exposes no nodes".into()));
        }
        let client = BankClient { config, connector, control: None, worker: None };
        client.initdb().await?;
        Ok(client)
    }

    async fn initdb(&self) -> Result<(), HarnessError> {
        let n_accounts = self.config.n_accounts;
        let connector = &self.connector;
        keep_trying(self.config.setup_tries, self.config.setup_delay, "initdb", move || async move {
            let mut conn = connector.connect(0).await?;
            conn.create_accounts(n_accounts).await
        })
        .await?;
        info!("Created {} accounts", n_accounts as u64 + 1);
        Ok(())
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn node_count(&self) -> usize {
        self.connector.node_count()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| w.is_running())
    }

    /// Starts the workload in the background and returns immediately.
    pub fn bgrun(&mut self) -> Result<(), HarnessError> {
        if self.worker.is_some() {
            return Err(HarnessError::AlreadyRunning);
        }
        let (control, handle) = worker::spawn(&self.config, Arc::clone(&self.connector))?;
        info!("Started workload on {} nodes", self.node_count());
        self.control = Some(control);
        self.worker = Some(handle);
        Ok(())
    }

    /// Returns the aggregates of the window that ends now and starts a new one.
    pub async fn get_aggregates(&mut self) -> Result<Snapshot, HarnessError> {
        let control = self.control.as_mut().ok_or(HarnessError::NotRunning)?;
        let snapshot = control.request_status().await?;
        info!("Aggregates:\n{}", snapshot.render_table());
        Ok(snapshot)
    }

    /// Starts a new window, discarding what was collected so far.
    pub async fn clean_aggregates(&mut self) -> Result<(), HarnessError> {
        let control = self.control.as_mut().ok_or(HarnessError::NotRunning)?;
        control.request_status().await?;
        info!("Aggregates cleaned");
        Ok(())
    }

    /// Stops the workload and waits for the worker to exit.
    pub async fn stop(&mut self) -> Result<WorkerReport, HarnessError> {
        let mut worker = self.worker.take().ok_or(HarnessError::NotRunning)?;
        self.control = None;
        let report = worker.stop().await?;
        info!(
            "Workload stopped: {} loops, {} aborted after grace period",
            report.loops, report.aborted
        );
        Ok(report)
    }

    /// True when every node returns the same digest of the accounts table.
    pub async fn is_data_identical(&self) -> Result<bool, HarnessError> {
        let mut digests = BTreeSet::new();
        for node in 0..self.node_count() {
            let digest = async {
                let mut conn = self.connector.connect(node).await?;
                conn.data_digest().await
            }
            .await
            .map_err(|source| HarnessError::Store {
                context: format!("digest of node {}", node + 1),
                source,
            })?;
            info!("Node {} hash = {}", node + 1, digest);
            digests.insert(digest);
        }
        Ok(digests.len() == 1)
    }

    /// Prepared transactions left unresolved, summed over all nodes.
    pub async fn prepared_count(&self) -> Result<usize, HarnessError> {
        let mut total = 0;
        for node in 0..self.node_count() {
            let count = async {
                let mut conn = self.connector.connect(node).await?;
                conn.prepared_count().await
            }
            .await
            .map_err(|source| HarnessError::Store {
                context: format!("prepared transactions of node {}", node + 1),
                source,
            })?;
            total += count;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fast_cluster, fast_config, ScriptedConnector};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn keep_trying_succeeds_after_failures() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let value = keep_trying(5, Duration::from_millis(1), "op", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::ConnectionClosed)
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn keep_trying_reports_last_error() {
        let err = keep_trying(3, Duration::from_millis(1), "initdb", || async {
            Err::<(), _>(StoreError::Query("relation does not exist".into()))
        })
        .await
        .unwrap_err();
        match err {
            HarnessError::SetupExhausted { name, tries, source } => {
                assert_eq!(name, "initdb");
                assert_eq!(tries, 3);
                assert_eq!(source, StoreError::Query("relation does not exist".into()));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn initdb_retries_until_node_accepts() {
        let connector = Arc::new(ScriptedConnector::new(1).failing_connects(3));
        let client = BankClient::new(fast_config(1), connector.clone()).await.unwrap();
        assert_eq!(client.node_count(), 1);
        assert_eq!(connector.connects(), 4);
    }

    #[tokio::test]
    async fn control_calls_need_a_running_workload() {
        let cluster = fast_cluster(3);
        let mut client = BankClient::new(fast_config(3), Arc::new(cluster.connector())).await.unwrap();
        assert!(matches!(client.get_aggregates().await, Err(HarnessError::NotRunning)));
        assert!(matches!(client.stop().await, Err(HarnessError::NotRunning)));

        client.bgrun().unwrap();
        assert!(matches!(client.bgrun(), Err(HarnessError::AlreadyRunning)));
        sleep(Duration::from_millis(100)).await;
        let snap = client.get_aggregates().await.unwrap();
        assert_eq!(snap.nodes(), vec![0, 1, 2]);
        client.stop().await.unwrap();
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn fresh_cluster_is_identical_with_nothing_prepared() {
        let cluster = fast_cluster(3);
        let client = BankClient::new(fast_config(3), Arc::new(cluster.connector())).await.unwrap();
        assert!(client.is_data_identical().await.unwrap());
        assert_eq!(client.prepared_count().await.unwrap(), 0);
    }
}
