// Error types for the harness.
//
// StoreError never escapes a workload iteration: its Display text becomes the
// outcome label. HarnessError is fatal for the run. AssertionFailure is a
// verdict about the store under test, not an infrastructure problem.

use thiserror::Error;

/// Failures raised by a node connection during one iteration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// `node` is the 0-based index; the message shows the 1-based number.
    #[error("could not connect to node {}: {}", .node + 1, .reason)]
    ConnectFailed { node: usize, reason: String },

    #[error("server closed the connection unexpectedly")]
    ConnectionClosed,

    /// Error reported by the server while executing a statement.
    #[error("{0}")]
    Query(String),

    #[error("update of account {uid} affected {rows} rows, expected 1")]
    RowCount { uid: u32, rows: u64 },

    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InFailedTransaction,

    #[error("there is no transaction in progress")]
    NoTransaction,

    #[error("cannot transfer between {0} accounts, at least 3 are needed")]
    TooFewAccounts(u32),
}

/// Errors that stop the whole run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{name} failed all {tries} tries: {source}")]
    SetupExhausted {
        name: String,
        tries: usize,
        #[source]
        source: StoreError,
    },

    #[error("control channel closed: {0}")]
    ChannelClosed(String),

    #[error("malformed control frame: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("workload is not running")]
    NotRunning,

    #[error("workload is already running")]
    AlreadyRunning,

    #[error("failed to start worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,

    #[error("failure injection '{scenario}' failed: {reason}")]
    Injection { scenario: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error during {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },
}

/// A snapshot did not show what the scenario requires.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssertionFailure {
    #[error("Isolation failure: {violations} violations on node {node}")]
    Isolation { node: usize, violations: u64 },

    #[error("No commits during aggregation interval on node {node}")]
    NoCommits { node: usize },

    #[error("There are commits during aggregation interval on node {node}")]
    UnexpectedCommits { node: usize },

    #[error("node {node} missing from snapshot")]
    MissingNode { node: usize },

    #[error("Different data on nodes")]
    DataMismatch,

    #[error("There are {0} uncommitted prepared transactions")]
    PreparedLeft(usize),
}

/// Outcome of one suite scenario: infrastructure trouble and failed
/// expectations are kept apart.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Harness(#[from] HarnessError),

    #[error(transparent)]
    Assertion(#[from] AssertionFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_render_as_labels() {
        let err = StoreError::RowCount { uid: 7, rows: 0 };
        assert_eq!(err.to_string(), "update of account 7 affected 0 rows, expected 1");

        let err = StoreError::ConnectFailed { node: 2, reason: "Connection refused".into() };
        assert_eq!(err.to_string(), "could not connect to node 3: Connection refused");

        let err = StoreError::ConnectFailed { node: 0, reason: "timeout expired".into() };
        assert_eq!(err.to_string(), "could not connect to node 1: timeout expired");
    }

    #[test]
    fn setup_error_keeps_source() {
        let err = HarnessError::SetupExhausted {
            name: "initdb".into(),
            tries: 3,
            source: StoreError::ConnectionClosed,
        };
        assert!(err.to_string().starts_with("initdb failed all 3 tries"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn scenario_error_wraps_assertions() {
        let err: ScenarioError = AssertionFailure::NoCommits { node: 1 }.into();
        assert!(matches!(err, ScenarioError::Assertion(_)));
    }
}
