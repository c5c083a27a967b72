//! Persistence ledger: write-behind storage of processed exchanges.

pub mod bundle;
pub mod persist;

pub use bundle::{LedgerStats, PersistBundle, SaveOutcome, SaveSkipReason};
pub use persist::PersistenceLedger;
