use super::pump::{DeliveryPump, PumpContext, PumpHandle, PumpState};
use crate::coord::{CoordError, CoordinationStore};
use crate::mailbox::MailboxId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Mailboxes started and stopped by one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<MailboxId>,
    pub stopped: Vec<MailboxId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Keeps exactly one pump per active mailbox by polling the online registry.
///
/// Passes run strictly one after another because `reconcile` takes
/// `&mut self`. A pump told to stop is kept in `retiring` until it has
/// exited, and a replacement for the same mailbox waits for it.
pub struct OnlineObjectTracker {
    coord: Arc<dyn CoordinationStore>,
    ctx: Arc<PumpContext>,
    poll_interval: Duration,
    active: HashMap<MailboxId, PumpHandle>,
    retiring: HashMap<MailboxId, PumpHandle>,
}

impl OnlineObjectTracker {
    pub fn new(ctx: Arc<PumpContext>, poll_interval: Duration) -> Self {
        Self {
            coord: ctx.coord.clone(),
            ctx,
            poll_interval,
            active: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Every mailbox that should currently have a pump.
    pub async fn snapshot(&self) -> Result<BTreeSet<MailboxId>, CoordError> {
        let users = self.coord.online_users().await?;
        let groups = self.coord.active_groups().await?;
        Ok(users
            .into_iter()
            .map(MailboxId::user)
            .chain(groups.into_iter().map(MailboxId::group))
            .collect())
    }

    /// One pass: diff the snapshot against running pumps.
    ///
    /// A failed snapshot read returns the error and changes nothing.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport, CoordError> {
        let snapshot = self.snapshot().await?;
        let mut report = ReconcileReport::default();

        self.retiring.retain(|_, handle| !handle.is_finished());
        let crashed: Vec<MailboxId> = self
            .active
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(mailbox, _)| *mailbox)
            .collect();
        for mailbox in crashed {
            tracing::warn!("pump for {mailbox} exited on its own; restarting");
            if let Some(handle) = self.active.remove(&mailbox) {
                handle.join().await;
            }
        }

        let gone: Vec<MailboxId> = self
            .active
            .keys()
            .filter(|mailbox| !snapshot.contains(mailbox))
            .copied()
            .collect();
        for mailbox in gone {
            if let Some(handle) = self.active.remove(&mailbox) {
                handle.teardown();
                self.retiring.insert(mailbox, handle);
                report.stopped.push(mailbox);
            }
        }

        for mailbox in snapshot {
            if self.active.contains_key(&mailbox) {
                continue;
            }
            if let Some(previous) = self.retiring.remove(&mailbox) {
                previous.join().await;
            }
            let handle = DeliveryPump::spawn(mailbox, self.ctx.clone());
            self.active.insert(mailbox, handle);
            report.started.push(mailbox);
        }
        Ok(report)
    }

    /// Reconcile on every tick (the first fires immediately) until cancelled,
    /// then stop every pump.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.reconcile().await {
                    Ok(report) if !report.is_empty() => tracing::info!(
                        "online mailboxes changed: {} started, {} stopped, {} active",
                        report.started.len(),
                        report.stopped.len(),
                        self.active.len()
                    ),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(
                        "online snapshot failed; keeping {} pumps: {err:?}",
                        self.active.len()
                    ),
                },
            }
        }
        self.shutdown().await;
    }

    /// Tear down every pump and wait for all of them.
    pub async fn shutdown(&mut self) {
        let handles: Vec<PumpHandle> = self
            .active
            .drain()
            .chain(self.retiring.drain())
            .map(|(_, handle)| handle)
            .collect();
        tracing::info!("draining {} delivery pumps", handles.len());
        for handle in &handles {
            handle.teardown();
        }
        futures::future::join_all(handles.into_iter().map(PumpHandle::join)).await;
    }

    pub fn active(&self) -> Vec<MailboxId> {
        let mut mailboxes: Vec<MailboxId> = self.active.keys().copied().collect();
        mailboxes.sort();
        mailboxes
    }

    pub fn pump_state(&self, mailbox: MailboxId) -> Option<PumpState> {
        self.active.get(&mailbox).map(PumpHandle::state)
    }

    pub fn retiring_len(&self) -> usize {
        self.retiring.len()
    }
}
