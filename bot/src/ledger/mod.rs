//! Quota ledger: the repository interface over users and their conversation turns.
//!
//! Each mutating method is one unit of work: it runs in a single transaction
//! and either commits completely or not at all.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{ConversationTurn, Turn, UsageField, User};

#[cfg(test)]
pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("user {0} does not exist")]
    UserNotFound(Uuid),

    #[error("refusing to add negative amount {amount} to {field}")]
    NegativeAmount { field: &'static str, amount: i64 },
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Fetch the user for a platform identity, creating it on first contact.
    ///
    /// Concurrent calls for the same identity resolve to the same row.
    async fn get_or_create_user(&self, external_id: i64) -> Result<User, LedgerError>;

    /// Get-or-create bounded by the registered-user cap.
    ///
    /// A known identity is always returned. A new one is created only while
    /// fewer than `max_users` users exist, otherwise `None`. The count and the
    /// insert happen atomically, so concurrent newcomers cannot overshoot.
    async fn admit_user(&self, external_id: i64, max_users: i64)
        -> Result<Option<User>, LedgerError>;

    /// Lookup without creating
    async fn find_user(&self, external_id: i64) -> Result<Option<User>, LedgerError>;

    /// Fresh read of a user's counters
    async fn user(&self, user_id: Uuid) -> Result<User, LedgerError>;

    async fn count_users(&self) -> Result<i64, LedgerError>;

    /// Add `amount` to one counter and return the updated row
    async fn increment_usage(
        &self,
        user_id: Uuid,
        field: UsageField,
        amount: i64,
    ) -> Result<User, LedgerError>;

    /// Append turns in order
    async fn append_turns(&self, user_id: Uuid, turns: &[Turn]) -> Result<(), LedgerError>;

    /// The most recent `limit` turns, oldest first
    async fn list_recent_turns(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, LedgerError>;

    /// Bill a chat round and store its prompt/reply pair in one transaction
    async fn commit_chat_round(
        &self,
        user_id: Uuid,
        tokens: i64,
        prompt: &str,
        reply: &str,
    ) -> Result<User, LedgerError>;
}

pub(crate) fn check_amount(field: UsageField, amount: i64) -> Result<(), LedgerError> {
    if amount < 0 {
        return Err(LedgerError::NegativeAmount {
            field: field.as_str(),
            amount,
        });
    }
    Ok(())
}
