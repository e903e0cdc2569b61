use crate::archive::{MemoryArchive, MessageArchive};
use crate::config::{AuthConfig, CoordinationBackend, Config};
use crate::coord::{CoordinationStore, MemoryCoordinator};
use crate::delivery::{Dispatcher, OnlineObjectTracker, PumpContext, PumpOptions};
use crate::gateway::{
    start_listener, start_push_plane, Gateway, GatewayDeps, GatewayOptions, HttpSessionAuthority,
    InstanceDirectory, LocalSessionAuthority, PushService, SessionAuthority,
};
use crate::mailbox::{MailboxLog, MemoryLog};
use crate::ops::metrics::SwitchboardMetrics;
use crate::ops::telemetry::{self, LogHandle, TelemetryState};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Addresses actually bound by [`Runtime::start`].
#[derive(Debug, Clone, Copy)]
pub struct RuntimeAddrs {
    pub gateway: SocketAddr,
    pub push_plane: SocketAddr,
    pub telemetry: Option<SocketAddr>,
}

/// One gateway instance: client listener, push plane, delivery tracker and
/// telemetry endpoint over a shared coordination store and mailbox log.
pub struct Runtime {
    config: Config,
    coord: Arc<dyn CoordinationStore>,
    log: Arc<dyn MailboxLog>,
    archive: Arc<dyn MessageArchive>,
    metrics: Arc<SwitchboardMetrics>,
    gateway: Arc<Gateway>,
    directory: Arc<InstanceDirectory>,
    pump_ctx: Arc<PumpContext>,
    telemetry: Arc<TelemetryState>,
    tracker_cancel: CancellationToken,
    tracker_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl Runtime {
    /// Validate `config` and build the in-process stores. Must run inside a
    /// tokio runtime because the gateway spawns its bucket workers.
    pub fn new(config: Config, log_handle: Option<LogHandle>) -> Result<Self> {
        let coord: Arc<dyn CoordinationStore> = match config.coordination.backend {
            CoordinationBackend::Memory => Arc::new(MemoryCoordinator::new()),
        };
        let log: Arc<dyn MailboxLog> = Arc::new(MemoryLog::new());
        Self::with_stores(config, coord, log, log_handle)
    }

    /// Build against externally owned stores, letting several instances share
    /// one coordination store and log.
    pub fn with_stores(
        config: Config,
        coord: Arc<dyn CoordinationStore>,
        log: Arc<dyn MailboxLog>,
        log_handle: Option<LogHandle>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(SwitchboardMetrics::default());
        let archive: Arc<dyn MessageArchive> = Arc::new(MemoryArchive::new());
        let authority: Arc<dyn SessionAuthority> = match &config.auth {
            AuthConfig::Local { tokens } => Arc::new(LocalSessionAuthority::new(
                tokens.clone(),
                coord.clone(),
                log.clone(),
            )),
            AuthConfig::Http {
                endpoint,
                timeout_ms,
            } => Arc::new(HttpSessionAuthority::new(
                endpoint.clone(),
                Duration::from_millis(*timeout_ms),
            )),
        };

        let instance_id = config.gateway.instance_id.clone();
        let gateway = Arc::new(Gateway::new(
            instance_id.clone(),
            GatewayOptions::from(&config.gateway),
            GatewayDeps {
                coord: coord.clone(),
                authority,
                archive: archive.clone(),
                metrics: metrics.clone(),
            },
        ));
        let local: Arc<dyn PushService> = gateway.clone();
        let directory = Arc::new(
            InstanceDirectory::new(instance_id.clone(), local)
                .with_remote_peers(&config.push_plane.peers, config.push_plane.timeout()),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            coord.clone(),
            directory.clone(),
            metrics.clone(),
        ));
        let pump_ctx = Arc::new(PumpContext {
            log: log.clone(),
            coord: coord.clone(),
            dispatcher,
            metrics: metrics.clone(),
            options: PumpOptions::from(&config.delivery),
        });
        let telemetry = Arc::new(TelemetryState::new(instance_id, metrics.clone()));

        Ok(Self {
            config,
            coord,
            log,
            archive,
            metrics,
            gateway,
            directory,
            pump_ctx,
            telemetry,
            tracker_cancel: CancellationToken::new(),
            tracker_task: None,
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    /// Start every component and wait for a shutdown signal.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.handle_shutdown().await
    }

    /// Bind listeners and start the tracker without waiting for shutdown.
    pub async fn start(&mut self) -> Result<RuntimeAddrs> {
        self.coord
            .online_users()
            .await
            .context("coordination store unreachable at startup")?;

        let gateway = start_listener(
            &self.config.gateway.bind,
            self.gateway.clone(),
            self.shutdown_rx.clone(),
        )
        .await?;
        let local: Arc<dyn PushService> = self.gateway.clone();
        let push_plane = start_push_plane(
            &self.config.push_plane.bind,
            local,
            self.log.clone(),
            self.config.push_plane.timeout(),
            self.shutdown_rx.clone(),
        )
        .await?;
        let telemetry = match &self.config.telemetry.metrics_bind {
            Some(bind) => Some(
                telemetry::start_http(bind, self.telemetry.clone(), self.log_handle.clone())
                    .await?,
            ),
            None => None,
        };

        let tracker =
            OnlineObjectTracker::new(self.pump_ctx.clone(), self.config.delivery.poll_interval());
        self.tracker_task = Some(tokio::spawn(tracker.run(self.tracker_cancel.clone())));
        self.telemetry.set_ready(true);
        tracing::info!(
            "{} ready: clients on {gateway}, push plane on {push_plane}, {} buckets, peers {:?}",
            self.gateway.instance_id(),
            self.gateway.buckets().len(),
            self.directory.peer_ids()
        );
        Ok(RuntimeAddrs {
            gateway,
            push_plane,
            telemetry,
        })
    }

    /// Handle that stops [`Runtime::run`] when `true` is sent.
    pub fn shutdown_signal(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    async fn handle_shutdown(&mut self) -> Result<()> {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested");
            }
        }
        self.drain().await
    }

    /// Stop accepting clients and push calls, then stop every pump.
    pub async fn drain(&mut self) -> Result<()> {
        tracing::info!("draining {}", self.gateway.instance_id());
        self.telemetry.set_ready(false);
        let _ = self.shutdown_tx.send(true);
        self.tracker_cancel.cancel();
        if let Some(task) = self.tracker_task.take() {
            task.await.context("delivery tracker panicked")?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn directory(&self) -> &Arc<InstanceDirectory> {
        &self.directory
    }

    pub fn coordinator(&self) -> &Arc<dyn CoordinationStore> {
        &self.coord
    }

    pub fn log(&self) -> &Arc<dyn MailboxLog> {
        &self.log
    }

    pub fn archive(&self) -> &Arc<dyn MessageArchive> {
        &self.archive
    }

    pub fn metrics(&self) -> &Arc<SwitchboardMetrics> {
        &self.metrics
    }

    pub fn telemetry(&self) -> &Arc<TelemetryState> {
        &self.telemetry
    }
}
