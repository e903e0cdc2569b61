//! Persistence of delivered chat messages.
//!
//! Delivery is at-least-once, so the archive must tolerate seeing the same
//! message more than once and keeps only the first copy per message id.

use crate::mailbox::{ChatMessage, LogPosition, MailboxKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub message_id: String,
    pub kind: MailboxKind,
    pub from: u64,
    pub target: u64,
    pub content: String,
    pub message_type: String,
    pub position: LogPosition,
}

impl ArchivedMessage {
    pub fn new(kind: MailboxKind, message: &ChatMessage, position: &LogPosition) -> Self {
        Self {
            message_id: message.message_id.clone(),
            kind,
            from: message.from,
            target: message.target,
            content: message.content.clone(),
            message_type: message.message_type.clone(),
            position: position.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MessageArchive: Send + Sync {
    /// Persist a batch, returning how many messages were new.
    async fn store(&self, batch: Vec<ArchivedMessage>) -> Result<usize, ArchiveError>;
}

#[derive(Default)]
struct Stored {
    ids: HashSet<String>,
    by_conversation: HashMap<(MailboxKind, u64), Vec<ArchivedMessage>>,
}

#[derive(Default)]
pub struct MemoryArchive {
    stored: Mutex<Stored>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stored.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages stored for one private or group conversation, in arrival order.
    pub fn conversation(&self, kind: MailboxKind, target: u64) -> Vec<ArchivedMessage> {
        self.stored
            .lock()
            .by_conversation
            .get(&(kind, target))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageArchive for MemoryArchive {
    async fn store(&self, batch: Vec<ArchivedMessage>) -> Result<usize, ArchiveError> {
        let mut stored = self.stored.lock();
        let mut fresh = 0;
        for message in batch {
            if !stored.ids.insert(message.message_id.clone()) {
                continue;
            }
            stored
                .by_conversation
                .entry((message.kind, message.target))
                .or_default()
                .push(message);
            fresh += 1;
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, offset: u64) -> ArchivedMessage {
        ArchivedMessage {
            message_id: id.into(),
            kind: MailboxKind::Group,
            from: 1,
            target: 7,
            content: "hi".into(),
            message_type: "text".into(),
            position: LogPosition::new("group_chat_7", 0, offset),
        }
    }

    #[tokio::test]
    async fn duplicates_are_ignored_by_message_id() {
        let archive = MemoryArchive::new();
        let stored = archive
            .store(vec![message("a", 0), message("b", 1), message("a", 0)])
            .await
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(archive.store(vec![message("b", 1)]).await.unwrap(), 0);
        let ids: Vec<_> = archive
            .conversation(MailboxKind::Group, 7)
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
