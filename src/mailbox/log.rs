//! Durable mailbox log contract.
//!
//! The production log client lives outside this crate; only append and
//! read-with-offset are required from it.

use super::{LogPosition, MailboxId};
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub position: LogPosition,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log unavailable for {topic}: {message}")]
    Unavailable { topic: String, message: String },
    #[error("reader for {0} is closed")]
    Closed(String),
}

impl LogError {
    pub fn unavailable(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            topic: topic.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait MailboxLog: Send + Sync {
    async fn open_reader(&self, mailbox: MailboxId) -> Result<Box<dyn LogReader>, LogError>;

    async fn append(&self, mailbox: MailboxId, payload: Bytes) -> Result<LogPosition, LogError>;
}

/// Sequential reader over one mailbox topic.
#[async_trait]
pub trait LogReader: Send {
    fn mailbox(&self) -> MailboxId;

    /// Position the reader so the next fetch returns the record at `offset`.
    async fn seek(&mut self, offset: u64) -> Result<(), LogError>;

    /// Wait for and return the next record. Blocks while the log is drained.
    async fn fetch(&mut self) -> Result<LogRecord, LogError>;

    async fn close(&mut self);
}
