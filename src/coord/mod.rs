//! Coordination store contract.
//!
//! The coordination store is the cluster's shared source of truth for who is
//! online, which gateway instance hosts each user, per-mailbox cursors, the
//! per-mailbox delivery lock and delivery acknowledgements. The production
//! store is external; [`MemoryCoordinator`] backs single-process deployments
//! and tests.

mod lock;
mod memory;

pub use lock::{LockError, MailboxLock, RetryPolicy};
pub use memory::MemoryCoordinator;

use crate::mailbox::{LogPosition, MailboxId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Delivered,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("coordination store unavailable during {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },
}

impl CoordError {
    pub fn unavailable(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            operation,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // -- online registry --------------------------------------------------

    async fn online_users(&self) -> Result<Vec<u64>, CoordError>;

    /// Groups whose online member count is not zero.
    async fn active_groups(&self) -> Result<Vec<u64>, CoordError>;

    async fn group_online_members(&self, group_id: u64) -> Result<Vec<u64>, CoordError>;

    async fn group_online_count(&self, group_id: u64) -> Result<u64, CoordError>;

    async fn hosting_instance(&self, user_id: u64) -> Result<Option<String>, CoordError>;

    async fn mark_online(
        &self,
        user_id: u64,
        instance_id: &str,
        group_ids: &[u64],
    ) -> Result<(), CoordError>;

    async fn mark_offline(&self, user_id: u64, group_ids: &[u64]) -> Result<(), CoordError>;

    // -- cursors ----------------------------------------------------------

    async fn cursor(&self, mailbox: MailboxId) -> Result<Option<LogPosition>, CoordError>;

    /// Record `position` as delivered. Never moves a cursor backwards on the
    /// same topic and partition.
    async fn commit_cursor(
        &self,
        mailbox: MailboxId,
        position: &LogPosition,
    ) -> Result<(), CoordError>;

    // -- locks ------------------------------------------------------------

    /// Set-if-absent with expiry. Returns whether `token` now holds `key`.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CoordError>;

    /// Release `key` if `token` still holds it.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CoordError>;

    /// Wait until `key` may have been released, at most `max_wait`.
    ///
    /// Stores without change notification fall back to sleeping.
    async fn wait_lock_change(&self, _key: &str, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }

    // -- delivery acknowledgements ---------------------------------------

    /// Record the write outcome for `position`. Once `Delivered` is held for a
    /// position, a later `Failed` from another instance leaves it in place.
    async fn acknowledge(
        &self,
        mailbox: MailboxId,
        position: &LogPosition,
        outcome: AckOutcome,
    ) -> Result<(), CoordError>;

    /// Wait for an acknowledgement of exactly `position` and consume it.
    async fn await_acknowledgement(
        &self,
        mailbox: MailboxId,
        position: &LogPosition,
    ) -> Result<AckOutcome, CoordError>;

    /// Drop any acknowledgement left over from an earlier attempt.
    async fn reset_acknowledgement(&self, mailbox: MailboxId) -> Result<(), CoordError>;
}
