// The recovery suite: a fixed list of failure scenarios run one after the
// other against one workload, followed by the teardown checks.

use crate::client::BankClient;
use crate::error::{AssertionFailure, HarnessError, ScenarioError};
use crate::failure::{
    CrashRecoverNode, EdgePartition, FailureInjector, FaultTarget, NoFailure, RestartNode,
    SingleNodePartition,
};
use crate::orchestrator::{
    assert_any_commits, assert_commits, assert_isolation, assert_no_commits, Experiment, WindowResults,
};
use log::{error, info};
use std::sync::Arc;
use tokio::time::sleep;

/// Which nodes must keep committing while a failure is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Every node commits.
    Available,
    /// The listed nodes must not commit, all others must.
    Unreachable(Vec<usize>),
    /// Nodes outside the cut link commit, and at least one side of it does.
    EitherSide(usize, usize),
}

impl Expectation {
    /// Checks both windows of an experiment on a cluster of `node_count` nodes.
    pub fn verify(&self, results: &WindowResults, node_count: usize) -> Result<(), AssertionFailure> {
        let all: Vec<usize> = (0..node_count).collect();
        let during = &results.during_failure;
        match self {
            Expectation::Available => assert_commits(during, &all)?,
            Expectation::Unreachable(down) => {
                let up: Vec<usize> = all.iter().copied().filter(|n| !down.contains(n)).collect();
                assert_commits(during, &up)?;
                assert_no_commits(during, down)?;
            }
            Expectation::EitherSide(a, b) => {
                let others: Vec<usize> = all.iter().copied().filter(|n| n != a && n != b).collect();
                assert_commits(during, &others)?;
                assert_any_commits(during, &[*a, *b])?;
            }
        }
        assert_isolation(during, &all)?;

        assert_commits(&results.after_recovery, &all)?;
        assert_isolation(&results.after_recovery, &all)
    }
}

struct Scenario {
    name: String,
    failure: Box<dyn FailureInjector>,
    expectation: Expectation,
}

#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub result: Result<WindowResults, ScenarioError>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
pub struct SuiteReport {
    pub scenarios: Vec<ScenarioReport>,
    pub teardown: Result<(), AssertionFailure>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.teardown.is_ok() && self.scenarios.iter().all(|s| s.passed())
    }

    pub fn failures(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .scenarios
            .iter()
            .filter_map(|s| s.result.as_ref().err().map(|e| format!("{}: {}", s.name, e)))
            .collect();
        if let Err(e) = &self.teardown {
            out.push(format!("teardown: {}", e));
        }
        out
    }
}

#[derive(Default)]
pub struct RecoverySuite {
    scenarios: Vec<Scenario>,
}

impl RecoverySuite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normal operations, then partition, restart and crash of the last node,
    /// then a cut between the last two nodes.
    pub fn standard(target: Arc<dyn FaultTarget>, node_count: usize) -> Self {
        let mut suite = Self::new().with_scenario("normal_operations", Box::new(NoFailure), Expectation::Available);
        if node_count < 2 {
            return suite;
        }
        let victim = node_count - 1;
        let peer = node_count - 2;
        suite = suite
            .with_scenario(
                "node_partition",
                Box::new(SingleNodePartition::new(Arc::clone(&target), victim)),
                Expectation::Unreachable(vec![victim]),
            )
            .with_scenario(
                "node_restart",
                Box::new(RestartNode::new(Arc::clone(&target), victim)),
                Expectation::Unreachable(vec![victim]),
            )
            .with_scenario(
                "node_crash",
                Box::new(CrashRecoverNode::new(Arc::clone(&target), victim)),
                Expectation::Unreachable(vec![victim]),
            );
        if node_count >= 3 {
            suite = suite.with_scenario(
                "edge_partition",
                Box::new(EdgePartition::new(target, peer, victim)),
                Expectation::EitherSide(peer, victim),
            );
        }
        suite
    }

    pub fn with_scenario(
        mut self,
        name: &str,
        failure: Box<dyn FailureInjector>,
        expectation: Expectation,
    ) -> Self {
        self.scenarios.push(Scenario { name: name.to_string(), failure, expectation });
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.scenarios.iter().map(|s| s.name.as_str()).collect()
    }

    /// Runs every scenario against the running workload of `client`, then
    /// stops the workload and checks the data left on the nodes.
    ///
    /// Assertion failures are reported per scenario and the suite carries on;
    /// infrastructure errors abort the run.
    pub async fn run(&self, client: &mut BankClient) -> Result<SuiteReport, HarnessError> {
        let settle = client.config().timings.settle;
        let node_count = client.node_count();
        let mut reports = Vec::with_capacity(self.scenarios.len());

        for (idx, scenario) in self.scenarios.iter().enumerate() {
            if idx > 0 {
                sleep(settle).await;
            }
            info!("==== {} ({}) ====", scenario.name, scenario.failure.name());
            let results = Experiment::new(client).perform_failure(scenario.failure.as_ref()).await?;
            let result = match scenario.expectation.verify(&results, node_count) {
                Ok(()) => {
                    info!("{} passed", scenario.name);
                    Ok(results)
                }
                Err(failure) => {
                    error!("{} failed: {}", scenario.name, failure);
                    Err(ScenarioError::from(failure))
                }
            };
            reports.push(ScenarioReport { name: scenario.name.clone(), result });
        }

        let teardown = Self::teardown(client).await?;
        Ok(SuiteReport { scenarios: reports, teardown })
    }

    async fn teardown(client: &mut BankClient) -> Result<Result<(), AssertionFailure>, HarnessError> {
        client.stop().await?;
        sleep(client.config().timings.stop_delay).await;
        if !client.is_data_identical().await? {
            error!("Different data on nodes");
            return Ok(Err(AssertionFailure::DataMismatch));
        }
        let prepared = client.prepared_count().await?;
        if prepared != 0 {
            error!("There are {} uncommitted prepared transactions", prepared);
            return Ok(Err(AssertionFailure::PreparedLeft(prepared)));
        }
        info!("Teardown checks passed");
        Ok(Ok(()))
    }
}
