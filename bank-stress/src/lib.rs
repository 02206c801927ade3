// Consistency and availability stress harness for multi-node transactional
// stores: perpetual bank-transfer workloads, per-loop outcome aggregates and
// windowed failure experiments.

pub mod aggregate;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod failure;
pub mod orchestrator;
pub mod registry;
pub mod simulation;
pub mod store;
pub mod suite;
pub mod worker;
pub mod workload;

pub mod test_utils; // shared by unit and integration tests

pub use aggregate::{normalize_outcome, AggregateSnapshot, OutcomeAggregate, COMMIT};
pub use client::{keep_trying, BankClient};
pub use config::{ExperimentTimings, HarnessConfig};
pub use error::{AssertionFailure, HarnessError, ScenarioError, StoreError};
pub use failure::{FailureInjector, FaultTarget};
pub use orchestrator::{Experiment, WindowResults};
pub use registry::{AggregationRegistry, Snapshot};
pub use suite::{Expectation, RecoverySuite, SuiteReport};
pub use workload::TxKind;
