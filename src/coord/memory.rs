use super::{AckOutcome, CoordError, CoordinationStore};
use crate::mailbox::{LogPosition, MailboxId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    hosting: HashMap<u64, String>,
    group_members: HashMap<u64, BTreeSet<u64>>,
    cursors: HashMap<MailboxId, LogPosition>,
    leases: HashMap<String, Lease>,
    /// Outstanding acknowledgements per mailbox, at most one per position.
    /// A `Delivered` entry is never downgraded to `Failed`.
    acks: HashMap<MailboxId, Vec<(LogPosition, AckOutcome)>>,
}

/// Coordination store kept in process memory.
///
/// Lock releases and acknowledgements wake waiters through [`Notify`]
/// instead of polling.
#[derive(Default)]
pub struct MemoryCoordinator {
    state: Mutex<State>,
    lock_released: Notify,
    acknowledged: Notify,
    lock_delay: Duration,
    unavailable: AtomicBool,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every lock operation, emulating a remote round trip.
    pub fn with_lock_delay(mut self, delay: Duration) -> Self {
        self.lock_delay = delay;
        self
    }

    /// Make online-registry reads fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn lock_holder(&self, key: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .leases
            .get(key)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.token.clone())
    }

    fn check_available(&self, operation: &'static str) -> Result<(), CoordError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordError::unavailable(operation, "store marked unavailable"));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        if !self.lock_delay.is_zero() {
            tokio::time::sleep(self.lock_delay).await;
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinator {
    async fn online_users(&self) -> Result<Vec<u64>, CoordError> {
        self.check_available("online_users")?;
        let mut users: Vec<u64> = self.state.lock().hosting.keys().copied().collect();
        users.sort_unstable();
        Ok(users)
    }

    async fn active_groups(&self) -> Result<Vec<u64>, CoordError> {
        self.check_available("active_groups")?;
        let state = self.state.lock();
        let mut groups: Vec<u64> = state
            .group_members
            .iter()
            .filter(|(_, members)| !members.is_empty())
            .map(|(group, _)| *group)
            .collect();
        groups.sort_unstable();
        Ok(groups)
    }

    async fn group_online_members(&self, group_id: u64) -> Result<Vec<u64>, CoordError> {
        self.check_available("group_online_members")?;
        let state = self.state.lock();
        Ok(state
            .group_members
            .get(&group_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn group_online_count(&self, group_id: u64) -> Result<u64, CoordError> {
        self.check_available("group_online_count")?;
        let state = self.state.lock();
        Ok(state
            .group_members
            .get(&group_id)
            .map_or(0, |members| members.len() as u64))
    }

    async fn hosting_instance(&self, user_id: u64) -> Result<Option<String>, CoordError> {
        self.check_available("hosting_instance")?;
        Ok(self.state.lock().hosting.get(&user_id).cloned())
    }

    async fn mark_online(
        &self,
        user_id: u64,
        instance_id: &str,
        group_ids: &[u64],
    ) -> Result<(), CoordError> {
        let mut state = self.state.lock();
        state.hosting.insert(user_id, instance_id.to_string());
        for group in group_ids {
            state.group_members.entry(*group).or_default().insert(user_id);
        }
        Ok(())
    }

    async fn mark_offline(&self, user_id: u64, group_ids: &[u64]) -> Result<(), CoordError> {
        let mut state = self.state.lock();
        state.hosting.remove(&user_id);
        for group in group_ids {
            if let Some(members) = state.group_members.get_mut(group) {
                members.remove(&user_id);
                if members.is_empty() {
                    state.group_members.remove(group);
                }
            }
        }
        Ok(())
    }

    async fn cursor(&self, mailbox: MailboxId) -> Result<Option<LogPosition>, CoordError> {
        Ok(self.state.lock().cursors.get(&mailbox).cloned())
    }

    async fn commit_cursor(
        &self,
        mailbox: MailboxId,
        position: &LogPosition,
    ) -> Result<(), CoordError> {
        let mut state = self.state.lock();
        let stale = state
            .cursors
            .get(&mailbox)
            .is_some_and(|current| current.covers(position));
        if !stale {
            state.cursors.insert(mailbox, position.clone());
        }
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CoordError> {
        self.simulate_latency().await;
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(lease) = state.leases.get(key) {
            if lease.expires_at > now {
                return Ok(false);
            }
        }
        state.leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CoordError> {
        self.simulate_latency().await;
        let released = {
            let mut state = self.state.lock();
            let holds = state
                .leases
                .get(key)
                .is_some_and(|lease| lease.token == token);
            if holds {
                state.leases.remove(key);
            }
            holds
        };
        if released {
            self.lock_released.notify_waiters();
        }
        Ok(released)
    }

    async fn wait_lock_change(&self, _key: &str, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.lock_released.notified()).await;
    }

    async fn acknowledge(
        &self,
        mailbox: MailboxId,
        position: &LogPosition,
        outcome: AckOutcome,
    ) -> Result<(), CoordError> {
        {
            let mut state = self.state.lock();
            let pending = state.acks.entry(mailbox).or_default();
            match pending.iter_mut().find(|(acked, _)| acked == position) {
                // Any instance that wrote the record confirms it for the group.
                Some((_, held)) if *held == AckOutcome::Delivered => {}
                Some((_, held)) => *held = outcome,
                None => pending.push((position.clone(), outcome)),
            }
        }
        self.acknowledged.notify_waiters();
        Ok(())
    }

    async fn await_acknowledgement(
        &self,
        mailbox: MailboxId,
        position: &LogPosition,
    ) -> Result<AckOutcome, CoordError> {
        loop {
            let notified = self.acknowledged.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(pending) = state.acks.get_mut(&mailbox) {
                    if let Some(index) = pending.iter().position(|(acked, _)| acked == position) {
                        let (_, outcome) = pending.swap_remove(index);
                        return Ok(outcome);
                    }
                }
            }
            notified.await;
        }
    }

    async fn reset_acknowledgement(&self, mailbox: MailboxId) -> Result<(), CoordError> {
        self.state.lock().acks.remove(&mailbox);
        Ok(())
    }
}
