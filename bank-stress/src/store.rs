use crate::error::StoreError;
use async_trait::async_trait;

/// Transaction state of a connection, as reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    InTransaction,
    /// A statement failed inside an open transaction; only rollback is accepted.
    InError,
}

/// Opens connections to the nodes of the store under test.
///
/// Nodes are addressed by their index in the ordered node list, which is
/// fixed for the lifetime of a run.
#[async_trait]
pub trait Connector: Send + Sync {
    fn node_count(&self) -> usize;

    async fn connect(&self, node: usize) -> Result<Box<dyn Connection>, StoreError>;
}

/// One client session against one node. Owned by exactly one workload loop.
#[async_trait]
pub trait Connection: Send {
    fn node(&self) -> usize;

    /// True once the session is unusable and must be re-established.
    fn is_closed(&self) -> bool;

    fn transaction_status(&self) -> TxStatus;

    async fn begin(&mut self) -> Result<(), StoreError>;

    /// `update accounts set amount = amount + delta where uid = ?`.
    /// Returns the number of rows affected.
    async fn add_to_balance(&mut self, uid: u32, delta: i64) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// `select sum(amount) from accounts`.
    async fn total_balance(&mut self) -> Result<i64, StoreError>;

    /// Drops and recreates the accounts table with uids `0..=n_accounts`,
    /// every balance 0.
    async fn create_accounts(&mut self, n_accounts: u32) -> Result<(), StoreError>;

    /// Hex digest of the whole accounts table in uid order.
    async fn data_digest(&mut self) -> Result<String, StoreError>;

    /// Number of prepared but unresolved two-phase transactions on this node.
    async fn prepared_count(&mut self) -> Result<usize, StoreError>;
}
