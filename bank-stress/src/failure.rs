// Failure injection scenarios.
//
// The orchestrator only ever calls start() and stop(). What a scenario does
// to the cluster goes through FaultTarget, so a scenario works against the
// simulated cluster or any real backend implementing the same controls.

use crate::error::HarnessError;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

/// Low level fault controls offered by a cluster backend. Nodes are 0-based.
#[async_trait]
pub trait FaultTarget: Send + Sync {
    /// Cuts every network link of `node`.
    async fn isolate(&self, node: usize) -> Result<(), HarnessError>;
    async fn heal(&self, node: usize) -> Result<(), HarnessError>;

    async fn cut_link(&self, a: usize, b: usize) -> Result<(), HarnessError>;
    async fn restore_link(&self, a: usize, b: usize) -> Result<(), HarnessError>;

    /// Kills the node process without any shutdown work.
    async fn crash(&self, node: usize) -> Result<(), HarnessError>;
    /// Stops the node cleanly.
    async fn shutdown(&self, node: usize) -> Result<(), HarnessError>;
    async fn start(&self, node: usize) -> Result<(), HarnessError>;
}

#[async_trait]
pub trait FailureInjector: Send + Sync {
    fn name(&self) -> String;

    /// Nodes that must not commit while the failure is active.
    fn unreachable_nodes(&self) -> Vec<usize> {
        Vec::new()
    }

    async fn start(&self) -> Result<(), HarnessError>;

    async fn stop(&self) -> Result<(), HarnessError>;
}

/// Baseline: nothing is injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailure;

#[async_trait]
impl FailureInjector for NoFailure {
    fn name(&self) -> String {
        "no failure".to_string()
    }

    async fn start(&self) -> Result<(), HarnessError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), HarnessError> {
        Ok(())
    }
}

/// Cuts one node off from all its peers.
pub struct SingleNodePartition {
    target: Arc<dyn FaultTarget>,
    node: usize,
}

impl SingleNodePartition {
    pub fn new(target: Arc<dyn FaultTarget>, node: usize) -> Self {
        SingleNodePartition { target, node }
    }
}

#[async_trait]
impl FailureInjector for SingleNodePartition {
    fn name(&self) -> String {
        format!("partition of node{}", self.node + 1)
    }

    fn unreachable_nodes(&self) -> Vec<usize> {
        vec![self.node]
    }

    async fn start(&self) -> Result<(), HarnessError> {
        info!("Partitioning node{} from the cluster", self.node + 1);
        self.target.isolate(self.node).await
    }

    async fn stop(&self) -> Result<(), HarnessError> {
        info!("Healing partition of node{}", self.node + 1);
        self.target.heal(self.node).await
    }
}

/// Cuts the link between two nodes; both still see the rest of the cluster.
pub struct EdgePartition {
    target: Arc<dyn FaultTarget>,
    a: usize,
    b: usize,
}

impl EdgePartition {
    pub fn new(target: Arc<dyn FaultTarget>, a: usize, b: usize) -> Self {
        EdgePartition { target, a, b }
    }
}

#[async_trait]
impl FailureInjector for EdgePartition {
    fn name(&self) -> String {
        format!("edge partition node{} <-> node{}", self.a + 1, self.b + 1)
    }

    async fn start(&self) -> Result<(), HarnessError> {
        self.target.cut_link(self.a, self.b).await
    }

    async fn stop(&self) -> Result<(), HarnessError> {
        self.target.restore_link(self.a, self.b).await
    }
}

/// Stops a node cleanly; it is started again on stop().
pub struct RestartNode {
    target: Arc<dyn FaultTarget>,
    node: usize,
}

impl RestartNode {
    pub fn new(target: Arc<dyn FaultTarget>, node: usize) -> Self {
        RestartNode { target, node }
    }
}

#[async_trait]
impl FailureInjector for RestartNode {
    fn name(&self) -> String {
        format!("restart of node{}", self.node + 1)
    }

    fn unreachable_nodes(&self) -> Vec<usize> {
        vec![self.node]
    }

    async fn start(&self) -> Result<(), HarnessError> {
        self.target.shutdown(self.node).await
    }

    async fn stop(&self) -> Result<(), HarnessError> {
        self.target.start(self.node).await
    }
}

/// Kills a node; it recovers on stop().
pub struct CrashRecoverNode {
    target: Arc<dyn FaultTarget>,
    node: usize,
}

impl CrashRecoverNode {
    pub fn new(target: Arc<dyn FaultTarget>, node: usize) -> Self {
        CrashRecoverNode { target, node }
    }
}

#[async_trait]
impl FailureInjector for CrashRecoverNode {
    fn name(&self) -> String {
        format!("crash of node{}", self.node + 1)
    }

    fn unreachable_nodes(&self) -> Vec<usize> {
        vec![self.node]
    }

    async fn start(&self) -> Result<(), HarnessError> {
        self.target.crash(self.node).await
    }

    async fn stop(&self) -> Result<(), HarnessError> {
        self.target.start(self.node).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Records every call so scenarios can be checked without a cluster.
    #[derive(Default)]
    struct RecordingTarget {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingTarget {
        fn push(&self, call: String) -> Result<(), HarnessError> {
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl FaultTarget for RecordingTarget {
        async fn isolate(&self, node: usize) -> Result<(), HarnessError> {
            self.push(format!("isolate {}", node))
        }
        async fn heal(&self, node: usize) -> Result<(), HarnessError> {
            self.push(format!("heal {}", node))
        }
        async fn cut_link(&self, a: usize, b: usize) -> Result<(), HarnessError> {
            self.push(format!("cut {} {}", a, b))
        }
        async fn restore_link(&self, a: usize, b: usize) -> Result<(), HarnessError> {
            self.push(format!("restore {} {}", a, b))
        }
        async fn crash(&self, node: usize) -> Result<(), HarnessError> {
            self.push(format!("crash {}", node))
        }
        async fn shutdown(&self, node: usize) -> Result<(), HarnessError> {
            self.push(format!("shutdown {}", node))
        }
        async fn start(&self, node: usize) -> Result<(), HarnessError> {
            self.push(format!("start {}", node))
        }
    }

    #[tokio::test]
    async fn scenarios_drive_the_expected_controls() {
        let target = Arc::new(RecordingTarget::default());
        let scenarios: Vec<Box<dyn FailureInjector>> = vec![
            Box::new(NoFailure),
            Box::new(SingleNodePartition::new(target.clone(), 2)),
            Box::new(EdgePartition::new(target.clone(), 1, 2)),
            Box::new(RestartNode::new(target.clone(), 2)),
            Box::new(CrashRecoverNode::new(target.clone(), 2)),
        ];
        for scenario in &scenarios {
            scenario.start().await.unwrap();
            scenario.stop().await.unwrap();
        }
        let calls = target.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "isolate 2", "heal 2",
                "cut 1 2", "restore 1 2",
                "shutdown 2", "start 2",
                "crash 2", "start 2",
            ]
        );
    }

    #[test]
    fn unreachable_nodes_per_scenario() {
        let target: Arc<dyn FaultTarget> = Arc::new(RecordingTarget::default());
        assert!(NoFailure.unreachable_nodes().is_empty());
        assert_eq!(SingleNodePartition::new(target.clone(), 2).unreachable_nodes(), vec![2]);
        assert!(EdgePartition::new(target.clone(), 1, 2).unreachable_nodes().is_empty());
        assert_eq!(CrashRecoverNode::new(target, 0).name(), "crash of node1");
    }
}
