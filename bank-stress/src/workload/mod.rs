// bank-stress/src/workload/mod.rs

pub mod runner;
pub mod transactions;

pub use runner::{LoopSettings, LoopState, WorkloadLoop};
pub use transactions::{InvariantTracker, TxBody};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of transaction a workload loop issues. Also the registry key suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Transfer,
    SumTotal,
}

impl TxKind {
    pub fn label(&self) -> &'static str {
        match self {
            TxKind::Transfer => "transfer",
            TxKind::SumTotal => "sumtotal",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
