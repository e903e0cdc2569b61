use super::log::{LogError, LogReader, LogRecord, MailboxLog};
use super::{LogPosition, MailboxId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

const PARTITION: u32 = 0;

/// In-process mailbox log: one single-partition topic per mailbox.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Vec<Bytes>>>,
    appended: Notify,
    open_readers: AtomicUsize,
}

impl Inner {
    fn record_at(&self, topic: &str, offset: u64) -> Option<Bytes> {
        let topics = self.topics.lock();
        topics
            .get(topic)
            .and_then(|records| records.get(offset as usize))
            .cloned()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended to `mailbox`.
    pub fn len(&self, mailbox: MailboxId) -> usize {
        self.inner
            .topics
            .lock()
            .get(&mailbox.topic())
            .map_or(0, Vec::len)
    }

    /// Readers opened and not yet closed or dropped.
    pub fn open_readers(&self) -> usize {
        self.inner.open_readers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxLog for MemoryLog {
    async fn open_reader(&self, mailbox: MailboxId) -> Result<Box<dyn LogReader>, LogError> {
        self.inner.open_readers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryReader {
            inner: self.inner.clone(),
            mailbox,
            topic: mailbox.topic(),
            next: 0,
            closed: false,
        }))
    }

    async fn append(&self, mailbox: MailboxId, payload: Bytes) -> Result<LogPosition, LogError> {
        let topic = mailbox.topic();
        let offset = {
            let mut topics = self.inner.topics.lock();
            let records = topics.entry(topic.clone()).or_default();
            records.push(payload);
            (records.len() - 1) as u64
        };
        self.inner.appended.notify_waiters();
        Ok(LogPosition::new(topic, PARTITION, offset))
    }
}

struct MemoryReader {
    inner: Arc<Inner>,
    mailbox: MailboxId,
    topic: String,
    next: u64,
    closed: bool,
}

impl MemoryReader {
    fn mark_closed(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.open_readers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl LogReader for MemoryReader {
    fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    async fn seek(&mut self, offset: u64) -> Result<(), LogError> {
        if self.closed {
            return Err(LogError::Closed(self.topic.clone()));
        }
        self.next = offset;
        Ok(())
    }

    async fn fetch(&mut self) -> Result<LogRecord, LogError> {
        if self.closed {
            return Err(LogError::Closed(self.topic.clone()));
        }
        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(payload) = self.inner.record_at(&self.topic, self.next) {
                let position = LogPosition::new(self.topic.clone(), PARTITION, self.next);
                self.next += 1;
                return Ok(LogRecord { position, payload });
            }
            notified.await;
        }
    }

    async fn close(&mut self) {
        self.mark_closed();
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fetch_returns_records_in_append_order() {
        let log = MemoryLog::new();
        let mailbox = MailboxId::user(9);
        for body in ["a", "b", "c"] {
            log.append(mailbox, Bytes::from(body)).await.unwrap();
        }
        let mut reader = log.open_reader(mailbox).await.unwrap();
        reader.seek(1).await.unwrap();
        let record = reader.fetch().await.unwrap();
        assert_eq!(record.position, LogPosition::new("friend_chat_9", 0, 1));
        assert_eq!(record.payload, Bytes::from("b"));
        assert_eq!(reader.fetch().await.unwrap().position.offset, 2);
    }

    #[tokio::test]
    async fn fetch_blocks_until_append() {
        let log = MemoryLog::new();
        let mailbox = MailboxId::group(4);
        let mut reader = log.open_reader(mailbox).await.unwrap();
        let pending = tokio::spawn(async move { reader.fetch().await.map(|r| r.position.offset) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        log.append(mailbox, Bytes::from("x")).await.unwrap();
        let offset = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn closed_and_dropped_readers_are_released() {
        let log = MemoryLog::new();
        let mut first = log.open_reader(MailboxId::user(1)).await.unwrap();
        let second = log.open_reader(MailboxId::user(1)).await.unwrap();
        assert_eq!(log.open_readers(), 2);
        first.close().await;
        first.close().await;
        assert_eq!(log.open_readers(), 1);
        assert!(matches!(first.fetch().await, Err(LogError::Closed(_))));
        drop(second);
        assert_eq!(log.open_readers(), 0);
    }
}
