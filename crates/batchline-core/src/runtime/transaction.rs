//! Transaction boundary control for the chunk loop.
//!
//! The chunk loop brackets every flush in exactly one `begin` followed by
//! `commit` or `rollback`. The manager hands out one transaction object per
//! chunk loop, keyed by the loop's checkpoint key.

use batchline_types::checkpoint::CheckpointKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("begin failed: {0}")]
    Begin(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("transaction timed out after {0}s")]
    Timeout(u64),
}

pub trait Transaction: Send {
    /// Timeout for the next `begin`, in seconds.
    fn set_timeout(&mut self, secs: u64) -> Result<(), TransactionError>;
    fn begin(&mut self) -> Result<(), TransactionError>;
    fn commit(&mut self) -> Result<(), TransactionError>;
    fn rollback(&mut self) -> Result<(), TransactionError>;
}

pub trait TransactionManager: Send + Sync {
    fn transaction(&self, key: &CheckpointKey) -> Box<dyn Transaction>;
}

/// For artifacts that manage their own durability.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransactionManager;

impl TransactionManager for NoopTransactionManager {
    fn transaction(&self, _key: &CheckpointKey) -> Box<dyn Transaction> {
        Box::new(NoopTransaction)
    }
}

struct NoopTransaction;

impl Transaction for NoopTransaction {
    fn set_timeout(&mut self, _secs: u64) -> Result<(), TransactionError> {
        Ok(())
    }

    fn begin(&mut self) -> Result<(), TransactionError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TransactionError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), TransactionError> {
        Ok(())
    }
}
