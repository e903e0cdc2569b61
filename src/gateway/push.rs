//! Push operations a gateway instance exposes to dispatchers.
//!
//! Every call is fire-and-forget and carries the log position of the record
//! it delivers, so the receiving write loop can confirm exactly that record.

use crate::mailbox::{ChatMessage, GroupCount, GroupRoster, LogPosition, Presence};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push {operation} to {instance} unavailable: {message}")]
    Unavailable {
        instance: String,
        operation: &'static str,
        message: String,
    },
}

impl PushError {
    pub fn unavailable(
        instance: impl Into<String>,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::Unavailable {
            instance: instance.into(),
            operation,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait PushService: Send + Sync {
    async fn push_private_message(
        &self,
        position: LogPosition,
        recipient: u64,
        message: ChatMessage,
    ) -> Result<(), PushError>;

    async fn push_group_message(
        &self,
        position: LogPosition,
        group_id: u64,
        message: ChatMessage,
    ) -> Result<(), PushError>;

    async fn push_group_roster(
        &self,
        position: LogPosition,
        roster: GroupRoster,
    ) -> Result<(), PushError>;

    async fn push_group_count(
        &self,
        position: LogPosition,
        count: GroupCount,
    ) -> Result<(), PushError>;

    async fn push_presence_online(
        &self,
        position: LogPosition,
        recipient: u64,
        presence: Presence,
    ) -> Result<(), PushError>;

    async fn push_presence_offline(
        &self,
        position: LogPosition,
        recipient: u64,
        presence: Presence,
    ) -> Result<(), PushError>;
}

/// Push-plane route for each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushRoute {
    Private,
    Group,
    Roster,
    Count,
    Online,
    Offline,
}

impl PushRoute {
    pub const ALL: [PushRoute; 6] = [
        Self::Private,
        Self::Group,
        Self::Roster,
        Self::Count,
        Self::Online,
        Self::Offline,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Self::Private => "/v1/push/private",
            Self::Group => "/v1/push/group",
            Self::Roster => "/v1/push/roster",
            Self::Count => "/v1/push/count",
            Self::Online => "/v1/push/online",
            Self::Offline => "/v1/push/offline",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|route| route.path() == path)
    }

    pub fn operation(self) -> &'static str {
        match self {
            Self::Private => "push_private_message",
            Self::Group => "push_group_message",
            Self::Roster => "push_group_roster",
            Self::Count => "push_group_count",
            Self::Online => "push_presence_online",
            Self::Offline => "push_presence_offline",
        }
    }
}

/// JSON body of a push-plane request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushBody<T> {
    pub position: LogPosition,
    /// Recipient user id, or the group id for group routes.
    pub target: u64,
    pub payload: T,
}
