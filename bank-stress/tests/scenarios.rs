// bank-stress/tests/scenarios.rs

// Failure scenarios against the simulated 3-node cluster, with windows
// shortened to fractions of a second.

use bank_stress::failure::{CrashRecoverNode, NoFailure, RestartNode, SingleNodePartition};
use bank_stress::orchestrator::{assert_commits, assert_isolation, assert_no_commits};
use bank_stress::simulation::SimCluster;
use bank_stress::test_utils::{fast_cluster, fast_config};
use bank_stress::{BankClient, Expectation, Experiment, FailureInjector, RecoverySuite};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn running_client(cluster: &Arc<SimCluster>) -> BankClient {
    let config = fast_config(cluster.node_count());
    let mut client = BankClient::new(config, Arc::new(cluster.connector()))
        .await
        .expect("initdb");
    client.bgrun().expect("bgrun");
    client
}

#[tokio::test]
async fn no_failure_three_nodes() {
    init_logging();
    let cluster = fast_cluster(3);
    let mut client = running_client(&cluster).await;

    let results = Experiment::new(&mut client).perform_failure(&NoFailure).await.unwrap();
    for snapshot in [&results.during_failure, &results.after_recovery] {
        assert_eq!(snapshot.nodes(), vec![0, 1, 2]);
        assert_commits(snapshot, &[0, 1, 2]).unwrap();
        assert_isolation(snapshot, &[0, 1, 2]).unwrap();
    }
    client.stop().await.unwrap();
    assert!(client.is_data_identical().await.unwrap());
}

#[tokio::test]
async fn node3_partitioned_then_healed() {
    init_logging();
    let cluster = fast_cluster(3);
    let mut client = running_client(&cluster).await;

    let failure = SingleNodePartition::new(cluster.clone(), 2);
    let results = Experiment::new(&mut client).perform_failure(&failure).await.unwrap();

    let during = &results.during_failure;
    assert_commits(during, &[0, 1]).unwrap();
    assert!(!during.transfer(2).unwrap().outcomes.contains_key("commit"));
    assert_isolation(during, &[0, 1, 2]).unwrap();

    let after = &results.after_recovery;
    assert_commits(after, &[0, 1, 2]).unwrap();
    assert_isolation(after, &[0, 1, 2]).unwrap();

    client.stop().await.unwrap();
    assert!(client.is_data_identical().await.unwrap());
}

#[tokio::test]
async fn partition_aborts_share_one_label() {
    init_logging();
    let cluster = fast_cluster(3);
    let mut client = running_client(&cluster).await;

    let failure = SingleNodePartition::new(cluster.clone(), 2);
    let results = Experiment::new(&mut client).perform_failure(&failure).await.unwrap();
    // the volatile transaction tag never reaches the labels
    for label in results.during_failure.transfer(2).unwrap().outcomes.keys() {
        assert!(!label.contains("MTM-"), "label not normalized: {}", label);
    }
    client.stop().await.unwrap();
}

#[tokio::test]
async fn restart_and_crash_recover() {
    init_logging();
    let cluster = fast_cluster(3);
    let mut client = running_client(&cluster).await;

    let failures: Vec<Box<dyn FailureInjector>> = vec![
        Box::new(RestartNode::new(cluster.clone(), 2)),
        Box::new(CrashRecoverNode::new(cluster.clone(), 2)),
    ];
    for failure in &failures {
        let results = Experiment::new(&mut client).perform_failure(failure.as_ref()).await.unwrap();
        assert_no_commits(&results.during_failure, &[2]).unwrap();
        Expectation::Unreachable(vec![2])
            .verify(&results, 3)
            .unwrap_or_else(|e| panic!("{}: {}", failure.name(), e));
        assert!(cluster.is_up(2));
    }
    client.stop().await.unwrap();
    assert_eq!(client.prepared_count().await.unwrap(), 0);
}

#[tokio::test]
async fn standard_suite_passes_on_simulated_cluster() {
    init_logging();
    let cluster = fast_cluster(3);
    let mut client = running_client(&cluster).await;

    let suite = RecoverySuite::standard(cluster.clone(), 3);
    let report = suite.run(&mut client).await.unwrap();
    assert_eq!(report.scenarios.len(), 5);
    assert!(report.passed(), "failures: {:?}", report.failures());
    assert!(!client.is_running());
}
