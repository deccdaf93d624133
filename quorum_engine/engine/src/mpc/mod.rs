//! Threshold wallet transaction lifecycle.

pub mod coordinator;
pub mod transaction;

pub use coordinator::{PendingIter, PendingTransactions, TransactionCoordinator};
pub use transaction::{ExecutedNonce, PendingTransaction, SubmissionState, TxStatus};
