use crate::error::StoreError;
use crate::store::Connection;
use crate::workload::TxKind;
use log::error;
use rand::{thread_rng, Rng};

/// Remembers the last conserved total a checker saw.
///
/// A violation is a transition to a different value, so a sustained wrong
/// value is counted once, not once per poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvariantTracker {
    last_seen: i64,
}

impl InvariantTracker {
    pub fn new(expected: i64) -> Self {
        InvariantTracker { last_seen: expected }
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    /// Returns true when `total` differs from the previous observation.
    pub fn observe(&mut self, total: i64) -> bool {
        if total != self.last_seen {
            self.last_seen = total;
            true
        } else {
            false
        }
    }
}

/// What a workload loop does in one iteration.
#[derive(Clone, Debug)]
pub enum TxBody {
    /// Moves `amount` from a random account `a` in `[1, n_accounts - 2]` to `a + 1`.
    Transfer { n_accounts: u32, amount: i64 },
    /// Reads the total balance and tracks transitions.
    SumTotal { tracker: InvariantTracker },
}

impl TxBody {
    pub fn transfer(n_accounts: u32, amount: i64) -> Self {
        TxBody::Transfer { n_accounts, amount }
    }

    pub fn sum_total(expected_total: i64) -> Self {
        TxBody::SumTotal { tracker: InvariantTracker::new(expected_total) }
    }

    pub fn kind(&self) -> TxKind {
        match self {
            TxBody::Transfer { .. } => TxKind::Transfer,
            TxBody::SumTotal { .. } => TxKind::SumTotal,
        }
    }

    /// Runs one transaction. `Ok(true)` means it committed and observed a
    /// change of the conserved total.
    pub async fn execute(&mut self, conn: &mut dyn Connection) -> Result<bool, StoreError> {
        match self {
            TxBody::Transfer { n_accounts, amount } => {
                transfer_tx(conn, *n_accounts, *amount).await.map(|_| false)
            }
            TxBody::SumTotal { tracker } => total_tx(conn, tracker).await,
        }
    }
}

async fn transfer_tx(conn: &mut dyn Connection, n_accounts: u32, amount: i64) -> Result<(), StoreError> {
    if n_accounts < 3 {
        return Err(StoreError::TooFewAccounts(n_accounts));
    }
    // adjacent pair, so only one draw is needed
    let from_uid = thread_rng().gen_range(1..=n_accounts - 2);
    let to_uid = from_uid + 1;

    conn.begin().await?;
    let rows = conn.add_to_balance(from_uid, -amount).await?;
    if rows != 1 {
        return Err(StoreError::RowCount { uid: from_uid, rows });
    }
    let rows = conn.add_to_balance(to_uid, amount).await?;
    if rows != 1 {
        return Err(StoreError::RowCount { uid: to_uid, rows });
    }
    conn.commit().await
}

async fn total_tx(conn: &mut dyn Connection, tracker: &mut InvariantTracker) -> Result<bool, StoreError> {
    let total = conn.total_balance().await?;
    let changed = tracker.observe(total);
    if changed {
        error!("Isolation error on node {}, total = {}", conn.node() + 1, total);
    }
    Ok(changed)
}
