// bank-stress/src/simulation/mod.rs
//
// In-process stand-in for the store under test: a multi-master bank cluster
// with fault controls, used by the tests and the experiments binary.

pub mod cluster;
pub mod config;
pub mod connection;
pub mod network;

pub use cluster::SimCluster;
pub use config::SimClusterConfig;
pub use connection::{SimConnection, SimConnector};
