use crate::ops::metrics::SwitchboardMetrics;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize JSON logging with reloadable level.
pub fn init_tracing(log_level: Option<&str>) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

/// What the telemetry endpoint reports on.
pub struct TelemetryState {
    instance_id: String,
    metrics: Arc<SwitchboardMetrics>,
    ready: AtomicBool,
}

impl TelemetryState {
    pub fn new(instance_id: impl Into<String>, metrics: Arc<SwitchboardMetrics>) -> Self {
        Self {
            instance_id: instance_id.into(),
            metrics,
            ready: AtomicBool::new(false),
        }
    }

    /// Ready once every listener is bound and the tracker runs; cleared on drain.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Start a minimal HTTP endpoint serving metrics, health, and loglevel controls.
pub async fn start_http(
    bind: &str,
    state: Arc<TelemetryState>,
    log_handle: Option<LogHandle>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind telemetry endpoint on {bind}"))?;
    let local = listener.local_addr()?;
    tracing::info!("telemetry endpoint listening on {}", local);
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _addr)) => {
                    let state = state.clone();
                    let log_handle = log_handle.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(&mut socket, state, log_handle).await {
                            tracing::warn!("telemetry handler error: {err:?}");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!("telemetry accept error: {err:?}");
                }
            }
        }
    });
    Ok(local)
}

async fn handle_conn(
    socket: &mut TcpStream,
    state: Arc<TelemetryState>,
    log_handle: Option<LogHandle>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let n = socket.read(&mut buf).await?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first = req.lines().next().unwrap_or("");
    let target = first.split_whitespace().nth(1).unwrap_or("/");
    let (route, query) = target.split_once('?').unwrap_or((target, ""));
    let (status, body, content_type) = match route {
        "/metrics" => (200, state.metrics.snapshot().render(), "text/plain"),
        "/readyz" => readyz(&state),
        "/livez" => livez(&state),
        "/v1/loglevel" => match (log_handle, query.strip_prefix("level=")) {
            (Some(handle), Some(level)) => match EnvFilter::try_new(level) {
                Ok(filter) => match handle.modify(|f| *f = filter) {
                    Ok(()) => {
                        tracing::info!("log level set to {level}");
                        (200, "{\"status\":\"ok\"}".to_string(), "application/json")
                    }
                    Err(err) => {
                        tracing::error!("log level reload failed: {err:?}");
                        (
                            500,
                            format!("{{\"error\":\"reload failed: {err}\"}}"),
                            "application/json",
                        )
                    }
                },
                Err(_) => (
                    400,
                    format!("{{\"error\":\"invalid level {level}\"}}"),
                    "application/json",
                ),
            },
            _ => (200, "{\"status\":\"ok\"}".to_string(), "application/json"),
        },
        _ => (404, "not found".to_string(), "text/plain"),
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        content_type,
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    Ok(())
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

pub fn readyz(state: &TelemetryState) -> (u16, String, &'static str) {
    let ready = state.is_ready();
    let snapshot = state.metrics.snapshot();
    let code = if ready { 200 } else { 503 };
    let body = format!(
        "{{\"ready\":{},\"instance_id\":\"{}\",\"connections\":{},\"pumps\":{}}}",
        ready, state.instance_id, snapshot.connections_active, snapshot.pumps_active
    );
    (code, body, "application/json")
}

pub fn livez(state: &TelemetryState) -> (u16, String, &'static str) {
    let body = format!(
        "{{\"live\":true,\"instance_id\":\"{}\"}}",
        state.instance_id
    );
    (200, body, "application/json")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn serves_metrics_and_readiness() {
        let metrics = Arc::new(SwitchboardMetrics::default());
        metrics.connection_opened();
        let state = Arc::new(TelemetryState::new("ws-test", metrics));
        let addr = start_http("127.0.0.1:0", state.clone(), None).await.unwrap();

        let body = get(addr, "/metrics").await;
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("switchboard_connections_active 1"));

        assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));
        state.set_ready(true);
        assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 200"));
        assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn loglevel_reports_reload_outcome() {
        let state = Arc::new(TelemetryState::new(
            "ws-test",
            Arc::new(SwitchboardMetrics::default()),
        ));
        let (layer, handle) =
            reload::Layer::<EnvFilter, tracing_subscriber::Registry>::new(EnvFilter::new("info"));
        let addr = start_http("127.0.0.1:0", state, Some(handle))
            .await
            .unwrap();
        assert!(get(addr, "/v1/loglevel?level=debug")
            .await
            .starts_with("HTTP/1.1 200"));

        drop(layer);
        let reply = get(addr, "/v1/loglevel?level=warn").await;
        assert!(reply.starts_with("HTTP/1.1 500"), "{reply}");
    }
}
