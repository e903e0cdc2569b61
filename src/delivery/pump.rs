use super::dispatcher::{DispatchError, Dispatcher};
use crate::config::DeliveryConfig;
use crate::coord::{
    AckOutcome, CoordError, CoordinationStore, LockError, MailboxLock, RetryPolicy,
};
use crate::mailbox::{
    resume_offset, Envelope, LogError, LogPosition, LogReader, LogRecord, MailboxId, MailboxLog,
};
use crate::ops::metrics::SwitchboardMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    /// How long a dispatched record may wait for its delivery confirmation.
    pub ack_timeout: Duration,
    pub lock: RetryPolicy,
    /// Pause before re-initialising after a transient failure.
    pub reinit_backoff: Duration,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            lock: RetryPolicy::default(),
            reinit_backoff: Duration::from_secs(1),
        }
    }
}

impl From<&DeliveryConfig> for PumpOptions {
    fn from(cfg: &DeliveryConfig) -> Self {
        Self {
            ack_timeout: Duration::from_millis(cfg.ack_timeout_ms),
            lock: RetryPolicy {
                ttl: Duration::from_millis(cfg.lock_ttl_ms),
                retry_interval: Duration::from_millis(cfg.lock_retry_ms),
                max_attempts: cfg.lock_max_attempts,
            },
            reinit_backoff: Duration::from_millis(cfg.reinit_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpState {
    Initializing,
    FetchPending,
    /// Delivering the record at this offset.
    Delivering(u64),
    Reinitializing,
    Terminating,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Coord(#[from] CoordError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("no gateway instance took {0}")]
    NoRecipients(LogPosition),
    #[error("{0} was not confirmed in time")]
    Timeout(LogPosition),
    #[error("gateway failed to write {0}")]
    Rejected(LogPosition),
    #[error("fetch step ended")]
    FetchEnded,
    #[error("teardown requested")]
    Cancelled,
}

impl PumpError {
    fn is_teardown(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Lock(LockError::Cancelled(_)))
    }
}

/// Everything a pump shares with its siblings.
pub struct PumpContext {
    pub log: Arc<dyn MailboxLog>,
    pub coord: Arc<dyn CoordinationStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<SwitchboardMetrics>,
    pub options: PumpOptions,
}

/// Owner's side of a running pump.
pub struct PumpHandle {
    mailbox: MailboxId,
    cancel: CancellationToken,
    state: watch::Receiver<PumpState>,
    join: JoinHandle<()>,
}

impl PumpHandle {
    pub fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    pub fn state(&self) -> PumpState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<PumpState> {
        self.state.clone()
    }

    /// Signal teardown; the pump stops at its next step boundary.
    pub fn teardown(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait until the pump and its fetch step have exited.
    pub async fn join(self) {
        if let Err(err) = self.join.await {
            tracing::warn!("pump for {} panicked: {err:?}", self.mailbox);
        }
    }
}

/// Drains one mailbox in log order.
///
/// The mailbox lock is taken per delivery attempt, never for the pump's
/// lifetime. Record N+1 is requested from the fetch step only once record N
/// was confirmed or skipped, so delivery order follows log order.
pub struct DeliveryPump {
    mailbox: MailboxId,
    ctx: Arc<PumpContext>,
    state: watch::Sender<PumpState>,
}

impl DeliveryPump {
    pub fn spawn(mailbox: MailboxId, ctx: Arc<PumpContext>) -> PumpHandle {
        let cancel = CancellationToken::new();
        let (state, state_rx) = watch::channel(PumpState::Initializing);
        let pump = Self {
            mailbox,
            ctx,
            state,
        };
        let join = tokio::spawn(pump.run(cancel.clone()));
        PumpHandle {
            mailbox,
            cancel,
            state: state_rx,
            join,
        }
    }

    fn set_state(&self, state: PumpState) {
        self.state.send_replace(state);
    }

    async fn run(self, cancel: CancellationToken) {
        let metrics = self.ctx.metrics.clone();
        metrics.pump_started();
        tracing::info!("pump for {} started", self.mailbox);
        let mut first = true;
        while !cancel.is_cancelled() {
            if first {
                first = false;
            } else {
                self.set_state(PumpState::Reinitializing);
                metrics.pump_reinitialized();
            }
            let mut fetch = match self.initialize(&cancel).await {
                Ok(fetch) => fetch,
                Err(err) if err.is_teardown() => break,
                Err(err) => {
                    tracing::warn!("pump for {} failed to initialize: {err:?}", self.mailbox);
                    self.backoff(&cancel).await;
                    continue;
                }
            };
            let outcome = self.drain(&mut fetch, &cancel).await;
            fetch.shutdown().await;
            match outcome {
                Err(err) if err.is_teardown() => break,
                Err(PumpError::Timeout(position)) => {
                    metrics.delivery_timed_out();
                    tracing::warn!(
                        "pump for {} re-delivering from the last cursor: {position} unconfirmed",
                        self.mailbox
                    );
                }
                Err(err @ PumpError::Rejected(_)) => {
                    tracing::warn!("pump for {} re-delivering: {err}", self.mailbox);
                }
                Err(err) => {
                    tracing::warn!("pump for {} re-initializing: {err:?}", self.mailbox);
                    self.backoff(&cancel).await;
                }
                Ok(()) => break,
            }
        }
        self.set_state(PumpState::Terminating);
        tracing::info!("pump for {} stopped", self.mailbox);
        self.set_state(PumpState::Stopped);
        metrics.pump_stopped();
    }

    async fn backoff(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.ctx.options.reinit_backoff) => {}
        }
    }

    /// Position a fresh reader just past the committed cursor, under the lock.
    async fn initialize(&self, cancel: &CancellationToken) -> Result<FetchStep, PumpError> {
        let ctx = &self.ctx;
        let mut lock = MailboxLock::acquire(
            ctx.coord.clone(),
            self.mailbox.lock_key(),
            &ctx.options.lock,
            cancel,
        )
        .await?;
        let opened = self.open_reader().await;
        if let Err(err) = lock.release().await {
            tracing::warn!("pump for {} could not release its lock: {err:?}", self.mailbox);
        }
        let reader = opened?;
        Ok(FetchStep::spawn(reader, cancel))
    }

    async fn open_reader(&self) -> Result<Box<dyn LogReader>, PumpError> {
        let cursor = self.ctx.coord.cursor(self.mailbox).await?;
        let offset = resume_offset(&self.mailbox, cursor.as_ref());
        let mut reader = self.ctx.log.open_reader(self.mailbox).await?;
        if let Err(err) = reader.seek(offset).await {
            reader.close().await;
            return Err(err.into());
        }
        tracing::debug!("pump for {} resumes at offset {offset}", self.mailbox);
        Ok(reader)
    }

    /// Deliver records until something forces a re-initialisation.
    async fn drain(
        &self,
        fetch: &mut FetchStep,
        cancel: &CancellationToken,
    ) -> Result<(), PumpError> {
        fetch.request_next();
        loop {
            self.set_state(PumpState::FetchPending);
            let record = tokio::select! {
                _ = cancel.cancelled() => return Err(PumpError::Cancelled),
                record = fetch.next() => record.ok_or(PumpError::FetchEnded)??,
            };
            if cancel.is_cancelled() {
                return Err(PumpError::Cancelled);
            }
            self.set_state(PumpState::Delivering(record.position.offset));
            self.deliver(record, fetch, cancel).await?;
        }
    }

    async fn deliver(
        &self,
        record: LogRecord,
        fetch: &FetchStep,
        cancel: &CancellationToken,
    ) -> Result<(), PumpError> {
        let ctx = &self.ctx;
        let mut lock = MailboxLock::acquire(
            ctx.coord.clone(),
            self.mailbox.lock_key(),
            &ctx.options.lock,
            cancel,
        )
        .await?;
        let outcome = self.deliver_locked(&record, fetch, cancel).await;
        if let Err(err) = lock.release().await {
            tracing::warn!("pump for {} could not release its lock: {err:?}", self.mailbox);
        }
        outcome
    }

    async fn deliver_locked(
        &self,
        record: &LogRecord,
        fetch: &FetchStep,
        cancel: &CancellationToken,
    ) -> Result<(), PumpError> {
        let ctx = &self.ctx;
        let position = &record.position;
        if let Some(cursor) = ctx.coord.cursor(self.mailbox).await? {
            if cursor.covers(position) {
                tracing::debug!("{position} already confirmed at {cursor}");
                ctx.metrics.delivery_skipped();
                fetch.request_next();
                return Ok(());
            }
        }

        let envelope = match Envelope::decode(&record.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("skipping undecodable record {position}: {err}");
                return self.skip(position, fetch).await;
            }
        };

        ctx.coord.reset_acknowledgement(self.mailbox).await?;
        let report = match ctx.dispatcher.dispatch(self.mailbox, position, &envelope).await {
            Ok(report) => report,
            Err(DispatchError::Misaddressed { op, mailbox }) => {
                tracing::warn!("skipping {op} record {position} misfiled in {mailbox}");
                return self.skip(position, fetch).await;
            }
            Err(err) => return Err(err.into()),
        };
        if !report.reached_any() {
            return Err(PumpError::NoRecipients(position.clone()));
        }

        let confirmation = tokio::select! {
            _ = cancel.cancelled() => return Err(PumpError::Cancelled),
            outcome = tokio::time::timeout(
                ctx.options.ack_timeout,
                ctx.coord.await_acknowledgement(self.mailbox, position),
            ) => outcome,
        };
        match confirmation {
            Ok(Ok(AckOutcome::Delivered)) => {
                // The outcome of N is known; N+1 may be fetched while N commits.
                fetch.request_next();
                ctx.coord.commit_cursor(self.mailbox, position).await?;
                ctx.metrics.delivery_confirmed();
                Ok(())
            }
            Ok(Ok(AckOutcome::Failed)) => Err(PumpError::Rejected(position.clone())),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(PumpError::Timeout(position.clone())),
        }
    }

    /// Commit past a record that can never be delivered.
    async fn skip(&self, position: &LogPosition, fetch: &FetchStep) -> Result<(), PumpError> {
        self.ctx.coord.commit_cursor(self.mailbox, position).await?;
        self.ctx.metrics.delivery_skipped();
        fetch.request_next();
        Ok(())
    }
}

/// Background fetch of one record per ready token.
struct FetchStep {
    ready: mpsc::Sender<()>,
    records: mpsc::Receiver<Result<LogRecord, LogError>>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl FetchStep {
    fn spawn(mut reader: Box<dyn LogReader>, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let (ready, mut ready_rx) = mpsc::channel::<()>(1);
        let (records_tx, records) = mpsc::channel(1);
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = ready_rx.recv() => if next.is_none() { break },
                }
                let fetched = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    fetched = reader.fetch() => fetched,
                };
                let failed = fetched.is_err();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    sent = records_tx.send(fetched) => {
                        if sent.is_err() || failed {
                            break;
                        }
                    }
                }
            }
            reader.close().await;
        });
        Self {
            ready,
            records,
            cancel,
            join: Some(join),
        }
    }

    /// Allow the next record to be fetched. A pending token is not doubled.
    fn request_next(&self) {
        let _ = self.ready.try_send(());
    }

    async fn next(&mut self) -> Option<Result<LogRecord, LogError>> {
        self.records.recv().await
    }

    /// Cancel the fetch and wait until its reader is closed.
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                tracing::warn!("fetch step panicked: {err:?}");
            }
        }
    }
}
