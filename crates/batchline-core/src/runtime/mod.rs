//! Execution substrate the engine runs on: worker pool and transactions.

pub mod pool;
pub mod transaction;

pub use pool::{WorkHandle, WorkerError, WorkerPool};
pub use transaction::{NoopTransactionManager, Transaction, TransactionError, TransactionManager};
