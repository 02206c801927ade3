// experiments/src/main.rs
//
// Runs the recovery suite against an in-process simulated cluster.
// Usage: experiments [config.json]

use bank_stress::simulation::{SimCluster, SimClusterConfig};
use bank_stress::{BankClient, HarnessConfig, HarnessError, RecoverySuite};
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;

fn load_config() -> Result<HarnessConfig, HarnessError> {
    match std::env::args().nth(1) {
        Some(path) => HarnessConfig::from_file(path),
        None => Ok(HarnessConfig::default()),
    }
}

async fn run(config: HarnessConfig) -> Result<bool, HarnessError> {
    let cluster = SimCluster::new(SimClusterConfig::with_nodes(config.node_count));
    let node_count = config.node_count;
    let mut client = BankClient::new(config, Arc::new(cluster.connector())).await?;
    client.bgrun()?;

    let suite = RecoverySuite::standard(cluster.clone(), node_count);
    info!("Running scenarios: {}", suite.names().join(", "));
    let report = suite.run(&mut client).await?;

    for scenario in &report.scenarios {
        let verdict = if scenario.passed() { "ok" } else { "FAILED" };
        println!("{:<20} {}", scenario.name, verdict);
    }
    match &report.teardown {
        Ok(()) => println!("{:<20} ok", "teardown"),
        Err(e) => println!("{:<20} FAILED ({})", "teardown", e),
    }
    for failure in report.failures() {
        error!("{}", failure);
    }
    Ok(report.passed())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    env_logger::Builder::new()
        .filter_level(config.log_level)
        .parse_default_env()
        .init();

    match run(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("Experiment aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}
