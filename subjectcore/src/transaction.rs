//! Transaction boundary capability.
//!
//! A host that performs non-event side effects inside command handlers can
//! hand the router a [`TransactionBoundary`]. The router begins a transaction
//! before invoking the handler, appends the published events, and commits.
//! Any error before the commit rolls the transaction back.
//!
//! The event store cannot roll back an append. When `commit` fails after
//! events were appended, the router reports `CommandError::CommitFailed`,
//! which is never retried, and the events remain in the store.

use crate::errors::CommandResult;
use async_trait::async_trait;

/// Opens transactions around command handling.
#[async_trait]
pub trait TransactionBoundary: Send + Sync {
    /// Begins a transaction.
    ///
    /// # Errors
    /// * `CommandError::TransactionAborted` - If no transaction could be opened
    async fn begin(&self) -> CommandResult<Box<dyn Transaction>>;
}

/// An open transaction.
#[async_trait]
pub trait Transaction: Send {
    /// Makes the transaction's side effects durable.
    ///
    /// # Errors
    /// Any error; the router turns it into `CommandError::CommitFailed` if
    /// events were already appended.
    async fn commit(self: Box<Self>) -> CommandResult<()>;

    /// Discards the transaction's side effects.
    async fn rollback(self: Box<Self>) -> CommandResult<()>;
}
