// Hosts the workload loops and the control responder on a dedicated OS
// thread with its own tokio runtime, so that a stalled loop or a busy
// controller never delays the other side.

use crate::config::HarnessConfig;
use crate::control::{self, ControlChannel, ControlEndpoint};
use crate::error::HarnessError;
use crate::registry::AggregationRegistry;
use crate::store::Connector;
use crate::workload::{LoopSettings, TxBody, WorkloadLoop};
use futures::future::join_all;
use log::{error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{timeout, Duration};

/// What the worker reports once it has shut down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub loops: usize,
    /// Iterations completed by the loops that stopped on their own. Aborted
    /// loops contribute nothing.
    pub iterations: u64,
    /// Loops still busy after the grace period and aborted.
    pub aborted: usize,
}

pub struct WorkerHandle {
    running: watch::Sender<bool>,
    thread: Option<JoinHandle<WorkerReport>>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        *self.running.borrow() && self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Lowers the running flag and waits for the worker thread to exit.
    pub async fn stop(&mut self) -> Result<WorkerReport, HarnessError> {
        let thread = self.thread.take().ok_or(HarnessError::NotRunning)?;
        // the worker may already be gone; joining still reports how it ended
        let _ = self.running.send(false);
        let joined = tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|_| HarnessError::WorkerPanicked)?;
        joined.map_err(|_| HarnessError::WorkerPanicked)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.running.send(false);
    }
}

fn build_runtime(worker_threads: usize) -> std::io::Result<Runtime> {
    if worker_threads <= 1 {
        Builder::new_current_thread().enable_all().build()
    } else {
        Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("bank-workload")
            .enable_all()
            .build()
    }
}

/// Starts the worker: one transfer and one sumtotal loop per node, plus the
/// responder for the returned control channel.
pub fn spawn(
    config: &HarnessConfig,
    connector: Arc<dyn Connector>,
) -> Result<(ControlChannel, WorkerHandle), HarnessError> {
    config.validate()?;
    let runtime = build_runtime(config.worker_threads)?;
    let (control, endpoint) = control::channel();
    let (running_tx, running_rx) = watch::channel(true);

    let plan = WorkerPlan {
        settings: LoopSettings::from(config),
        n_accounts: config.n_accounts,
        amount: config.transfer_amount,
        expected_total: config.expected_total,
        grace: config.stop_grace,
    };
    let thread = thread::Builder::new()
        .name("bank-worker".to_string())
        .spawn(move || runtime.block_on(host(plan, connector, endpoint, running_rx)))?;

    Ok((control, WorkerHandle { running: running_tx, thread: Some(thread) }))
}

#[derive(Clone, Copy)]
struct WorkerPlan {
    settings: LoopSettings,
    n_accounts: u32,
    amount: i64,
    expected_total: i64,
    grace: Duration,
}

async fn host(
    plan: WorkerPlan,
    connector: Arc<dyn Connector>,
    endpoint: ControlEndpoint,
    mut running: watch::Receiver<bool>,
) -> WorkerReport {
    let registry = Arc::new(AggregationRegistry::new());
    let completed = Arc::new(AtomicU64::new(0));
    let mut loops = Vec::new();
    for node in 0..connector.node_count() {
        let bodies = [
            TxBody::transfer(plan.n_accounts, plan.amount),
            TxBody::sum_total(plan.expected_total),
        ];
        for body in bodies {
            let wl = WorkloadLoop::new(
                node,
                body,
                Arc::clone(&connector),
                &registry,
                plan.settings,
                running.clone(),
            );
            let completed = Arc::clone(&completed);
            loops.push(tokio::spawn(async move {
                let n = wl.run().await;
                completed.fetch_add(n, Ordering::Relaxed);
            }));
        }
    }
    let responder = tokio::spawn(endpoint.serve(Arc::clone(&registry)));
    info!("Worker started {} workload loops", loops.len());

    while *running.borrow_and_update() {
        if running.changed().await.is_err() {
            break;
        }
    }

    info!("Stop requested, waiting up to {:?} for loops to finish", plan.grace);
    let count = loops.len();
    let aborts: Vec<AbortHandle> = loops.iter().map(|h| h.abort_handle()).collect();
    let report = match timeout(plan.grace, join_all(loops)).await {
        Ok(results) => {
            for e in results.into_iter().filter_map(Result::err) {
                error!("Workload loop failed: {}", e);
            }
            WorkerReport { loops: count, iterations: completed.load(Ordering::Relaxed), aborted: 0 }
        }
        Err(_) => {
            let stuck: Vec<&AbortHandle> = aborts.iter().filter(|h| !h.is_finished()).collect();
            warn!("{} loops still busy after {:?}, aborting them", stuck.len(), plan.grace);
            for handle in &stuck {
                handle.abort();
            }
            WorkerReport {
                loops: count,
                iterations: completed.load(Ordering::Relaxed),
                aborted: stuck.len(),
            }
        }
    };
    responder.abort();
    report
}
