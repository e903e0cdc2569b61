//! Shared harness for the integration tests.
//!
//! - In-memory coordination store, log and pump context builders
//! - A scripted push service standing in for gateway instances
//! - Polling helpers for asynchronous assertions

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchboard::coord::{AckOutcome, CoordinationStore, MemoryCoordinator, RetryPolicy};
use switchboard::delivery::{Dispatcher, InstanceResolver, PumpContext, PumpOptions};
use switchboard::gateway::{PushError, PushService};
use switchboard::mailbox::{
    ChatMessage, Envelope, GroupCount, GroupRoster, LogError, LogPosition, LogReader, LogRecord,
    MailboxId, MailboxLog, MemoryLog, Presence,
};
use switchboard::ops::metrics::SwitchboardMetrics;

pub const INSTANCE: &str = "ws-test";

/// Poll `check` every 10ms until it holds, failing after five seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn chat(message_id: &str, from: u64, target: u64, content: &str) -> ChatMessage {
    ChatMessage {
        message_id: message_id.to_string(),
        from,
        target,
        content: content.to_string(),
        message_type: "text".to_string(),
        from_name: String::new(),
        created_at: String::new(),
    }
}

/// Append a private message addressed to `recipient`.
pub async fn append_private(log: &dyn MailboxLog, recipient: u64, message_id: &str) -> LogPosition {
    let envelope = Envelope::PrivateMessage(chat(message_id, 99, recipient, message_id));
    log.append(MailboxId::user(recipient), envelope.encode().unwrap())
        .await
        .unwrap()
}

/// Pump options scaled down for tests.
pub fn fast_options(ack_timeout: Duration) -> PumpOptions {
    PumpOptions {
        ack_timeout,
        lock: RetryPolicy {
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_millis(5),
            max_attempts: 2_000,
        },
        reinit_backoff: Duration::from_millis(20),
    }
}

// -----------------------------------------------------------------------------
// Scripted push service
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Confirm every push as delivered.
    Deliver,
    /// Report every push as a failed write.
    Fail,
    /// Accept the push and never confirm it.
    Silent,
}

/// A push service that records every call and acknowledges per [`AckMode`].
pub struct ScriptedPush {
    coord: Arc<dyn CoordinationStore>,
    mode: Mutex<AckMode>,
    pushes: Mutex<Vec<(MailboxId, LogPosition)>>,
}

impl ScriptedPush {
    pub fn new(coord: Arc<dyn CoordinationStore>, mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            coord,
            mode: Mutex::new(mode),
            pushes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: AckMode) {
        *self.mode.lock() = mode;
    }

    pub fn pushes(&self) -> Vec<(MailboxId, LogPosition)> {
        self.pushes.lock().clone()
    }

    /// Offsets pushed for `mailbox`, in call order.
    pub fn offsets(&self, mailbox: MailboxId) -> Vec<u64> {
        self.pushes
            .lock()
            .iter()
            .filter(|(pushed, _)| *pushed == mailbox)
            .map(|(_, position)| position.offset)
            .collect()
    }

    async fn record(&self, mailbox: MailboxId, position: LogPosition) -> Result<(), PushError> {
        self.pushes.lock().push((mailbox, position.clone()));
        let mode = *self.mode.lock();
        let outcome = match mode {
            AckMode::Deliver => AckOutcome::Delivered,
            AckMode::Fail => AckOutcome::Failed,
            AckMode::Silent => return Ok(()),
        };
        self.coord
            .acknowledge(mailbox, &position, outcome)
            .await
            .map_err(|err| PushError::unavailable(INSTANCE, "ack", err.to_string()))
    }
}

#[async_trait]
impl PushService for ScriptedPush {
    async fn push_private_message(
        &self,
        position: LogPosition,
        recipient: u64,
        _message: ChatMessage,
    ) -> Result<(), PushError> {
        self.record(MailboxId::user(recipient), position).await
    }

    async fn push_group_message(
        &self,
        position: LogPosition,
        group_id: u64,
        _message: ChatMessage,
    ) -> Result<(), PushError> {
        self.record(MailboxId::group(group_id), position).await
    }

    async fn push_group_roster(
        &self,
        position: LogPosition,
        roster: GroupRoster,
    ) -> Result<(), PushError> {
        self.record(MailboxId::group(roster.group_id), position)
            .await
    }

    async fn push_group_count(
        &self,
        position: LogPosition,
        count: GroupCount,
    ) -> Result<(), PushError> {
        self.record(MailboxId::group(count.group_id), position).await
    }

    async fn push_presence_online(
        &self,
        position: LogPosition,
        recipient: u64,
        _presence: Presence,
    ) -> Result<(), PushError> {
        self.record(MailboxId::user(recipient), position).await
    }

    async fn push_presence_offline(
        &self,
        position: LogPosition,
        recipient: u64,
        _presence: Presence,
    ) -> Result<(), PushError> {
        self.record(MailboxId::user(recipient), position).await
    }
}

/// Resolves every instance id to the same push service.
pub struct Everywhere(pub Arc<dyn PushService>);

impl InstanceResolver for Everywhere {
    fn resolve(&self, _instance_id: &str) -> Option<Arc<dyn PushService>> {
        Some(self.0.clone())
    }
}

/// Resolves each instance id to its own push service.
pub struct ByInstance(pub Vec<(&'static str, Arc<dyn PushService>)>);

impl InstanceResolver for ByInstance {
    fn resolve(&self, instance_id: &str) -> Option<Arc<dyn PushService>> {
        self.0
            .iter()
            .find(|(id, _)| *id == instance_id)
            .map(|(_, service)| service.clone())
    }
}

// -----------------------------------------------------------------------------
// Recording log
// -----------------------------------------------------------------------------

/// Wraps a [`MemoryLog`] and records every offset handed out by `fetch`.
#[derive(Clone)]
pub struct RecordingLog {
    inner: MemoryLog,
    fetched: Arc<Mutex<Vec<u64>>>,
}

impl RecordingLog {
    pub fn new(inner: MemoryLog) -> Self {
        Self {
            inner,
            fetched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl MailboxLog for RecordingLog {
    async fn open_reader(&self, mailbox: MailboxId) -> Result<Box<dyn LogReader>, LogError> {
        let inner = self.inner.open_reader(mailbox).await?;
        Ok(Box::new(RecordingReader {
            inner,
            fetched: self.fetched.clone(),
        }))
    }

    async fn append(&self, mailbox: MailboxId, payload: Bytes) -> Result<LogPosition, LogError> {
        self.inner.append(mailbox, payload).await
    }
}

struct RecordingReader {
    inner: Box<dyn LogReader>,
    fetched: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl LogReader for RecordingReader {
    fn mailbox(&self) -> MailboxId {
        self.inner.mailbox()
    }

    async fn seek(&mut self, offset: u64) -> Result<(), LogError> {
        self.inner.seek(offset).await
    }

    async fn fetch(&mut self) -> Result<LogRecord, LogError> {
        let record = self.inner.fetch().await?;
        self.fetched.lock().push(record.position.offset);
        Ok(record)
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

// -----------------------------------------------------------------------------
// Pump context
// -----------------------------------------------------------------------------

pub struct DeliveryHarness {
    pub coord: Arc<MemoryCoordinator>,
    pub push: Arc<ScriptedPush>,
    pub metrics: Arc<SwitchboardMetrics>,
    pub ctx: Arc<PumpContext>,
}

pub fn delivery_harness(
    coord: MemoryCoordinator,
    log: Arc<dyn MailboxLog>,
    mode: AckMode,
    options: PumpOptions,
) -> DeliveryHarness {
    let coord = Arc::new(coord);
    let push = ScriptedPush::new(coord.clone(), mode);
    let metrics = Arc::new(SwitchboardMetrics::default());
    let dispatcher = Arc::new(Dispatcher::new(
        coord.clone(),
        Arc::new(Everywhere(push.clone())),
        metrics.clone(),
    ));
    let ctx = Arc::new(PumpContext {
        log,
        coord: coord.clone(),
        dispatcher,
        metrics: metrics.clone(),
        options,
    });
    DeliveryHarness {
        coord,
        push,
        metrics,
        ctx,
    }
}
