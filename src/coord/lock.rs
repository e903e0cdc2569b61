use super::{CoordError, CoordinationStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bounded acquisition policy for a mailbox lock.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub ttl: Duration,
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(60_500),
            retry_interval: Duration::from_millis(50),
            max_attempts: 200,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} still held elsewhere after {attempts} attempts")]
    Exhausted { key: String, attempts: u32 },
    #[error("lock acquisition for {0} cancelled")]
    Cancelled(String),
    #[error(transparent)]
    Store(#[from] CoordError),
}

/// Distributed mutual exclusion over one mailbox, held per delivery attempt.
///
/// Each acquisition uses a fresh token so a holder can only ever release its
/// own lease, never one re-acquired by another pump after expiry.
pub struct MailboxLock {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    held: bool,
}

impl MailboxLock {
    pub async fn acquire(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self, LockError> {
        let key = key.into();
        let token = Uuid::new_v4().to_string();
        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled(key));
            }
            match store.try_lock(&key, &token, policy.ttl).await {
                Ok(true) => {
                    return Ok(Self {
                        store,
                        key,
                        token,
                        held: true,
                    })
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!("lock {key} attempt {attempt} failed: {err:?}");
                }
            }
            if attempt == attempts {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled(key.clone())),
                _ = store.wait_lock_change(&key, policy.retry_interval) => {}
            }
        }
        Err(LockError::Exhausted { key, attempts })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Release the lease. Calling it again is a no-op.
    pub async fn release(&mut self) -> Result<bool, CoordError> {
        if !self.held {
            return Ok(false);
        }
        self.held = false;
        self.store.unlock(&self.key, &self.token).await
    }
}

impl Drop for MailboxLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.unlock(&key, &token).await {
                        tracing::warn!("background unlock of {key} failed: {err:?}");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("lock {key} dropped outside a runtime; it expires after its ttl");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordinator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            ttl: Duration::from_secs(5),
            retry_interval: Duration::from_millis(5),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn second_holder_waits_for_release() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinator::new());
        let cancel = CancellationToken::new();
        let mut first = MailboxLock::acquire(store.clone(), "lock:a", &policy(10), &cancel)
            .await
            .unwrap();
        let contender = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                MailboxLock::acquire(store, "lock:a", &policy(400), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!contender.is_finished());
        assert!(first.release().await.unwrap());
        assert!(!first.release().await.unwrap());
        let second = contender.await.unwrap().unwrap();
        assert!(second.is_held());
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinator::new());
        let cancel = CancellationToken::new();
        let _held = MailboxLock::acquire(store.clone(), "lock:b", &policy(1), &cancel)
            .await
            .unwrap();
        let err = MailboxLock::acquire(store, "lock:b", &policy(3), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LockError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiting() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinator::new());
        let cancel = CancellationToken::new();
        let _held = MailboxLock::acquire(store.clone(), "lock:c", &policy(1), &cancel)
            .await
            .unwrap();
        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let cancel = waiter_cancel.clone();
            tokio::spawn(async move {
                MailboxLock::acquire(store, "lock:c", &policy(10_000), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(LockError::Cancelled(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_holders_never_overlap_with_slow_store() {
        let store: Arc<dyn CoordinationStore> =
            Arc::new(MemoryCoordinator::new().with_lock_delay(Duration::from_millis(2)));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                for _ in 0..5 {
                    let mut lock =
                        MailboxLock::acquire(store.clone(), "lock:race", &policy(10_000), &cancel)
                            .await
                            .unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.release().await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
