//! Mailbox identity and durable-log positions.
//!
//! A mailbox is the strictly ordered queue of one recipient, either a user or
//! a group. Each mailbox maps to one log topic; the coordination store keeps
//! the last confirmed [`LogPosition`] per mailbox as its cursor.

mod envelope;
mod log;
mod memory;

pub use envelope::{
    ChatMessage, Envelope, EnvelopeError, GroupCount, GroupRoster, OpCode, Presence, RosterMember,
};
pub use log::{LogError, LogReader, LogRecord, MailboxLog};
pub use memory::MemoryLog;

use serde::{Deserialize, Serialize};
use std::fmt;

const USER_TOPIC_PREFIX: &str = "friend_chat_";
const GROUP_TOPIC_PREFIX: &str = "group_chat_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxKind {
    User,
    Group,
}

/// Logical identity of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxId {
    pub kind: MailboxKind,
    pub id: u64,
}

impl MailboxId {
    pub const fn user(id: u64) -> Self {
        Self {
            kind: MailboxKind::User,
            id,
        }
    }

    pub const fn group(id: u64) -> Self {
        Self {
            kind: MailboxKind::Group,
            id,
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == MailboxKind::Group
    }

    /// Log topic backing this mailbox.
    pub fn topic(&self) -> String {
        match self.kind {
            MailboxKind::User => format!("{USER_TOPIC_PREFIX}{}", self.id),
            MailboxKind::Group => format!("{GROUP_TOPIC_PREFIX}{}", self.id),
        }
    }

    /// Coordination-store key of the mailbox's distributed lock.
    pub fn lock_key(&self) -> String {
        format!("lock:{}", self.topic())
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        if let Some(id) = topic.strip_prefix(USER_TOPIC_PREFIX) {
            return id.parse().ok().map(Self::user);
        }
        topic
            .strip_prefix(GROUP_TOPIC_PREFIX)
            .and_then(|id| id.parse().ok())
            .map(Self::group)
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic())
    }
}

/// Position of one record in the durable log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

impl LogPosition {
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// True when `self`, read as a cursor, already includes `other`.
    ///
    /// Positions on a different topic or partition never cover each other, so
    /// a cursor left behind by a reused mailbox identity cannot suppress new
    /// records.
    pub fn covers(&self, other: &LogPosition) -> bool {
        self.topic == other.topic && self.partition == other.partition && self.offset >= other.offset
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// First offset to fetch when resuming `mailbox` from its committed cursor.
pub fn resume_offset(mailbox: &MailboxId, cursor: Option<&LogPosition>) -> u64 {
    match cursor {
        Some(cursor) if cursor.topic == mailbox.topic() => cursor.offset.saturating_add(1),
        _ => 0,
    }
}
