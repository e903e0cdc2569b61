use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PUSH_PLANE_BIND_DEFAULT: &str = "127.0.0.1:7401";

/// Top-level configuration for a switchboard gateway instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub push_plane: PushPlaneConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Client-facing listener, registry sharding and per-session timers.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub bind: String,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    #[serde(default = "GatewayConfig::default_workers_per_bucket")]
    pub workers_per_bucket: usize,
    #[serde(default = "GatewayConfig::default_worker_queue_depth")]
    pub worker_queue_depth: usize,
    #[serde(default = "GatewayConfig::default_queue_depth")]
    pub message_queue_depth: usize,
    #[serde(default = "GatewayConfig::default_queue_depth")]
    pub status_queue_depth: usize,
    #[serde(default = "GatewayConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "GatewayConfig::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "GatewayConfig::default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "GatewayConfig::default_pong_wait_ms")]
    pub pong_wait_ms: u64,
    #[serde(default = "GatewayConfig::default_archive_flush_ms")]
    pub archive_flush_ms: u64,
}

impl GatewayConfig {
    const fn default_workers_per_bucket() -> usize {
        32
    }

    const fn default_worker_queue_depth() -> usize {
        20
    }

    const fn default_queue_depth() -> usize {
        1024
    }

    const fn default_max_frame_bytes() -> usize {
        8192
    }

    const fn default_write_timeout_ms() -> u64 {
        10_000
    }

    const fn default_ping_interval_ms() -> u64 {
        54_000
    }

    const fn default_pong_wait_ms() -> u64 {
        60_000
    }

    const fn default_archive_flush_ms() -> u64 {
        10_000
    }
}

/// Mailbox discovery and delivery pump tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "DeliveryConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "DeliveryConfig::default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "DeliveryConfig::default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "DeliveryConfig::default_lock_retry_ms")]
    pub lock_retry_ms: u64,
    #[serde(default = "DeliveryConfig::default_lock_max_attempts")]
    pub lock_max_attempts: u32,
    #[serde(default = "DeliveryConfig::default_reinit_backoff_ms")]
    pub reinit_backoff_ms: u64,
}

impl DeliveryConfig {
    const fn default_poll_interval_ms() -> u64 {
        5_000
    }

    const fn default_ack_timeout_ms() -> u64 {
        30_000
    }

    const fn default_lock_ttl_ms() -> u64 {
        60_500
    }

    const fn default_lock_retry_ms() -> u64 {
        50
    }

    const fn default_lock_max_attempts() -> u32 {
        200
    }

    const fn default_reinit_backoff_ms() -> u64 {
        1_000
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            ack_timeout_ms: Self::default_ack_timeout_ms(),
            lock_ttl_ms: Self::default_lock_ttl_ms(),
            lock_retry_ms: Self::default_lock_retry_ms(),
            lock_max_attempts: Self::default_lock_max_attempts(),
            reinit_backoff_ms: Self::default_reinit_backoff_ms(),
        }
    }
}

/// Instance-to-instance push RPC.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPlaneConfig {
    #[serde(default = "default_push_plane_bind")]
    pub bind: String,
    /// Address peers use to reach this instance when it differs from `bind`.
    #[serde(default)]
    pub advertise: Option<String>,
    #[serde(default = "PushPlaneConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Peer instance id to `host:port` of its push plane.
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
}

impl PushPlaneConfig {
    const fn default_timeout_ms() -> u64 {
        5_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for PushPlaneConfig {
    fn default() -> Self {
        Self {
            bind: default_push_plane_bind(),
            advertise: None,
            timeout_ms: Self::default_timeout_ms(),
            peers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub backend: CoordinationBackend,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationBackend {
    #[default]
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthConfig {
    Local {
        #[serde(default)]
        tokens: Vec<LocalToken>,
    },
    Http {
        endpoint: String,
        #[serde(default = "default_auth_timeout_ms")]
        timeout_ms: u64,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::Local { tokens: Vec::new() }
    }
}

/// Static credential accepted by the local session authority.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LocalToken {
    pub token: String,
    pub recipient_id: u64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub groups: Vec<u64>,
    /// Users whose mailboxes receive this user's presence changes.
    #[serde(default)]
    pub friends: Vec<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub metrics_bind: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via SWITCHBOARD_CONFIG or defaults to
    /// `config/switchboard.toml`, then apply environment overrides.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let gateway = &self.gateway;
        if gateway.instance_id.trim().is_empty() {
            bail!("gateway.instance_id must be non-empty");
        }
        if gateway.bucket_count == 0 {
            bail!("gateway.bucket_count must be > 0");
        }
        if gateway.workers_per_bucket == 0 || gateway.worker_queue_depth == 0 {
            bail!("gateway fan-out workers and their queue depth must be > 0");
        }
        if gateway.message_queue_depth == 0 || gateway.status_queue_depth == 0 {
            bail!("gateway outbound queue depths must be > 0");
        }
        if gateway.max_frame_bytes == 0 {
            bail!("gateway.max_frame_bytes must be > 0");
        }
        if gateway.write_timeout_ms == 0
            || gateway.ping_interval_ms == 0
            || gateway.pong_wait_ms == 0
            || gateway.archive_flush_ms == 0
        {
            bail!("gateway timers must be non-zero");
        }
        if gateway.ping_interval_ms >= gateway.pong_wait_ms {
            bail!(
                "gateway.ping_interval_ms ({}) must be below pong_wait_ms ({})",
                gateway.ping_interval_ms,
                gateway.pong_wait_ms
            );
        }

        let delivery = &self.delivery;
        if delivery.poll_interval_ms == 0
            || delivery.ack_timeout_ms == 0
            || delivery.lock_ttl_ms == 0
            || delivery.lock_retry_ms == 0
            || delivery.reinit_backoff_ms == 0
        {
            bail!("delivery timers must be non-zero");
        }
        if delivery.lock_max_attempts == 0 {
            bail!("delivery.lock_max_attempts must be > 0");
        }
        if delivery.ack_timeout_ms >= delivery.lock_ttl_ms {
            bail!(
                "delivery.ack_timeout_ms ({}) must be below lock_ttl_ms ({})",
                delivery.ack_timeout_ms,
                delivery.lock_ttl_ms
            );
        }

        if self.push_plane.timeout_ms == 0 {
            bail!("push_plane.timeout_ms must be > 0");
        }
        if bind_conflicts(&self.push_plane.bind, &gateway.bind) {
            bail!("push_plane.bind conflicts with gateway.bind");
        }
        if self.push_plane.peers.contains_key(&gateway.instance_id) {
            bail!(
                "push_plane.peers must not list this instance ({})",
                gateway.instance_id
            );
        }
        if let Some(metrics) = &self.telemetry.metrics_bind {
            if bind_conflicts(metrics, &gateway.bind) || bind_conflicts(metrics, &self.push_plane.bind)
            {
                bail!("telemetry.metrics_bind conflicts with a gateway listener");
            }
        }

        match &self.auth {
            AuthConfig::Local { tokens } => {
                let mut seen = HashSet::new();
                for token in tokens {
                    if token.token.is_empty() {
                        bail!("auth token for recipient {} is empty", token.recipient_id);
                    }
                    if token.recipient_id == 0 {
                        bail!("auth token recipient_id must be > 0");
                    }
                    if !seen.insert(token.token.as_str()) {
                        bail!("duplicate auth token for recipient {}", token.recipient_id);
                    }
                }
            }
            AuthConfig::Http {
                endpoint,
                timeout_ms,
            } => {
                if endpoint.trim().is_empty() {
                    bail!("auth.endpoint must be non-empty");
                }
                if *timeout_ms == 0 {
                    bail!("auth.timeout_ms must be > 0");
                }
            }
        }
        Ok(())
    }

    /// Address peers should use to reach this instance's push plane.
    pub fn push_plane_advertise(&self) -> &str {
        self.push_plane
            .advertise
            .as_deref()
            .unwrap_or(&self.push_plane.bind)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(instance_id) = std::env::var("SWITCHBOARD_INSTANCE_ID") {
            self.gateway.instance_id = instance_id;
        }
        if let Ok(bind) = std::env::var("SWITCHBOARD_GATEWAY_BIND") {
            self.gateway.bind = bind;
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SWITCHBOARD_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/switchboard.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

/// Two binds conflict when they name the same fixed port; port 0 never conflicts.
fn bind_conflicts(a: &str, b: &str) -> bool {
    if is_ephemeral(a) || is_ephemeral(b) {
        return false;
    }
    a == b
}

fn is_ephemeral(bind: &str) -> bool {
    bind.rsplit_once(':').is_some_and(|(_, port)| port == "0")
}

fn default_instance_id() -> String {
    format!("ws-{}", uuid::Uuid::new_v4())
}

fn default_bucket_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_push_plane_bind() -> String {
    PUSH_PLANE_BIND_DEFAULT.to_string()
}

fn default_auth_timeout_ms() -> u64 {
    5_000
}
