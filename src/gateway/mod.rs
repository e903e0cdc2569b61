//! Client-facing gateway: shard routing, session loops and the push plane.
//!
//! [`Gateway`] owns the registry buckets of one instance and implements
//! [`PushService`] for it, so a dispatcher in the same process calls it
//! directly while remote dispatchers reach it through the push-plane RPC.

mod authority;
mod directory;
mod listener;
mod push;
mod rpc;
mod session;

pub use authority::{
    AuthError, AuthGrant, HttpSessionAuthority, LocalSessionAuthority, SessionAuthority,
};
pub use directory::InstanceDirectory;
pub use listener::start_listener;
pub use push::{PushBody, PushError, PushRoute, PushService};
pub use rpc::{start_push_plane, AppendRequest, AppendResponse, RemotePushClient};
pub use session::{serve_connection, SessionOptions};

use crate::archive::MessageArchive;
use crate::config::GatewayConfig;
use crate::coord::CoordinationStore;
use crate::mailbox::{
    ChatMessage, Envelope, GroupCount, GroupRoster, LogPosition, MailboxId, Presence,
};
use crate::ops::metrics::SwitchboardMetrics;
use crate::registry::{Bucket, BucketOptions, Delivery, GroupBroadcast, QueueDepths};
use async_trait::async_trait;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;
use twox_hash::XxHash64;

/// Registry shard that owns `recipient_id`.
///
/// Pure: the same id and shard count always give the same shard.
pub fn bucket_index(recipient_id: u64, bucket_count: usize) -> usize {
    if bucket_count <= 1 {
        return 0;
    }
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&recipient_id.to_le_bytes());
    (hasher.finish() % bucket_count as u64) as usize
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayOptions {
    pub bucket_count: usize,
    pub bucket: BucketOptions,
    pub queues: QueueDepths,
    pub session: SessionOptions,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            bucket_count: 1,
            bucket: BucketOptions::default(),
            queues: QueueDepths::default(),
            session: SessionOptions::default(),
        }
    }
}

impl From<&GatewayConfig> for GatewayOptions {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            bucket_count: cfg.bucket_count,
            bucket: BucketOptions {
                workers: cfg.workers_per_bucket,
                worker_queue_depth: cfg.worker_queue_depth,
            },
            queues: QueueDepths {
                messages: cfg.message_queue_depth,
                statuses: cfg.status_queue_depth,
            },
            session: SessionOptions {
                max_frame_bytes: cfg.max_frame_bytes,
                write_timeout: Duration::from_millis(cfg.write_timeout_ms),
                ping_interval: Duration::from_millis(cfg.ping_interval_ms),
                pong_wait: Duration::from_millis(cfg.pong_wait_ms),
                archive_flush: Duration::from_millis(cfg.archive_flush_ms),
            },
        }
    }
}

/// Collaborators a gateway needs beyond its own registry.
#[derive(Clone)]
pub struct GatewayDeps {
    pub coord: Arc<dyn CoordinationStore>,
    pub authority: Arc<dyn SessionAuthority>,
    pub archive: Arc<dyn MessageArchive>,
    pub metrics: Arc<SwitchboardMetrics>,
}

/// The router of one gateway instance.
pub struct Gateway {
    instance_id: String,
    buckets: Vec<Bucket>,
    options: GatewayOptions,
    deps: GatewayDeps,
}

impl Gateway {
    /// Build every bucket. Must run inside a tokio runtime.
    pub fn new(instance_id: impl Into<String>, options: GatewayOptions, deps: GatewayDeps) -> Self {
        let buckets = (0..options.bucket_count.max(1))
            .map(|index| Bucket::new(index, options.bucket, deps.metrics.clone()))
            .collect();
        Self {
            instance_id: instance_id.into(),
            buckets,
            options,
            deps,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    pub fn bucket(&self, recipient_id: u64) -> &Bucket {
        &self.buckets[bucket_index(recipient_id, self.buckets.len())]
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn coord(&self) -> &Arc<dyn CoordinationStore> {
        &self.deps.coord
    }

    pub fn authority(&self) -> &Arc<dyn SessionAuthority> {
        &self.deps.authority
    }

    pub fn archive(&self) -> &Arc<dyn MessageArchive> {
        &self.deps.archive
    }

    pub fn metrics(&self) -> &Arc<SwitchboardMetrics> {
        &self.deps.metrics
    }

    pub fn connection_count(&self) -> usize {
        self.buckets.iter().map(Bucket::connection_count).sum()
    }

    fn deliver_to(&self, recipient: u64, delivery: Delivery) {
        if !self.bucket(recipient).deliver_to(recipient, delivery) {
            tracing::debug!(
                "{} has no live session for recipient {recipient}",
                self.instance_id
            );
        }
    }

    /// Hand a group delivery to every bucket holding members of the group.
    fn broadcast(&self, group_id: u64, delivery: Delivery) {
        for bucket in &self.buckets {
            if bucket.get_group_node(group_id).is_none() {
                continue;
            }
            bucket.broadcast(GroupBroadcast {
                group_id,
                delivery: delivery.clone(),
            });
        }
    }
}

/// The write loop confirms against the mailbox the position was read from.
fn mailbox_of(position: &LogPosition, fallback: MailboxId) -> MailboxId {
    MailboxId::from_topic(&position.topic).unwrap_or(fallback)
}

#[async_trait]
impl PushService for Gateway {
    async fn push_private_message(
        &self,
        position: LogPosition,
        recipient: u64,
        message: ChatMessage,
    ) -> Result<(), PushError> {
        let mailbox = mailbox_of(&position, MailboxId::user(recipient));
        let delivery = Delivery::new(mailbox, position, Envelope::PrivateMessage(message));
        self.deliver_to(recipient, delivery);
        Ok(())
    }

    async fn push_group_message(
        &self,
        position: LogPosition,
        group_id: u64,
        message: ChatMessage,
    ) -> Result<(), PushError> {
        let mailbox = mailbox_of(&position, MailboxId::group(group_id));
        let delivery = Delivery::new(mailbox, position, Envelope::GroupMessage(message));
        self.broadcast(group_id, delivery);
        Ok(())
    }

    async fn push_group_roster(
        &self,
        position: LogPosition,
        roster: GroupRoster,
    ) -> Result<(), PushError> {
        let group_id = roster.group_id;
        let mailbox = mailbox_of(&position, MailboxId::group(group_id));
        self.broadcast(
            group_id,
            Delivery::new(mailbox, position, Envelope::GroupRoster(roster)),
        );
        Ok(())
    }

    async fn push_group_count(
        &self,
        position: LogPosition,
        count: GroupCount,
    ) -> Result<(), PushError> {
        let group_id = count.group_id;
        let mailbox = mailbox_of(&position, MailboxId::group(group_id));
        self.broadcast(
            group_id,
            Delivery::new(mailbox, position, Envelope::GroupCount(count)),
        );
        Ok(())
    }

    async fn push_presence_online(
        &self,
        position: LogPosition,
        recipient: u64,
        presence: Presence,
    ) -> Result<(), PushError> {
        let mailbox = mailbox_of(&position, MailboxId::user(recipient));
        self.deliver_to(
            recipient,
            Delivery::new(mailbox, position, Envelope::PresenceOnline(presence)),
        );
        Ok(())
    }

    async fn push_presence_offline(
        &self,
        position: LogPosition,
        recipient: u64,
        presence: Presence,
    ) -> Result<(), PushError> {
        let mailbox = mailbox_of(&position, MailboxId::user(recipient));
        self.deliver_to(
            recipient,
            Delivery::new(mailbox, position, Envelope::PresenceOffline(presence)),
        );
        Ok(())
    }
}
