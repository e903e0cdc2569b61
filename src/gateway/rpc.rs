//! Push-plane RPC between gateway instances.
//!
//! The server side is a small HTTP/1.1 endpoint on a raw tokio listener,
//! one request per connection. The client side speaks to it with reqwest.

use super::push::{PushBody, PushError, PushRoute, PushService};
use crate::mailbox::{
    ChatMessage, Envelope, GroupCount, GroupRoster, LogPosition, MailboxId, MailboxLog, OpCode,
    Presence,
};
use crate::ops::telemetry::reason_phrase;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const APPEND_PATH: &str = "/v1/mailboxes/append";
const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Body of `POST /v1/mailboxes/append`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub mailbox: MailboxId,
    pub op: OpCode,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub position: LogPosition,
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

type Reply = (u16, String);

/// Serve the push plane on `bind` until shutdown flips.
///
/// A request that is not fully received within `read_timeout` is answered
/// with 408 and closed. Open connections are dropped on shutdown.
pub async fn start_push_plane(
    bind: &str,
    service: Arc<dyn PushService>,
    log: Arc<dyn MailboxLog>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind push plane on {bind}"))?;
    let local = listener.local_addr()?;
    tracing::info!("push plane listening on {local}");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((mut socket, peer)) => {
                        let service = service.clone();
                        let log = log.clone();
                        let stop = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                handled = handle_conn(&mut socket, service, log, read_timeout) => {
                                    if let Err(err) = handled {
                                        tracing::warn!("push plane request from {peer} failed: {err:?}");
                                    }
                                }
                                _ = stopped(stop) => {
                                    tracing::debug!("dropping push plane connection from {peer} on shutdown");
                                }
                            }
                        });
                    }
                    Err(err) => tracing::warn!("push plane accept error: {err:?}"),
                },
            }
        }
        tracing::info!("push plane on {local} stopped");
    });
    Ok(local)
}

/// Resolves once shutdown is signalled; never if the sender is gone.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let sender_gone = shutdown.wait_for(|stopping| *stopping).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

async fn handle_conn(
    socket: &mut TcpStream,
    service: Arc<dyn PushService>,
    log: Arc<dyn MailboxLog>,
    read_timeout: Duration,
) -> Result<()> {
    let (status, body) = match tokio::time::timeout(read_timeout, read_request(socket)).await {
        Ok(Ok(request)) => route(&request, service.as_ref(), log.as_ref()).await,
        Ok(Err(err)) => (400, error_body(&format!("{err:#}"))),
        Err(_) => (
            408,
            error_body(&format!("request not received within {read_timeout:?}")),
        ),
    };
    let resp = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    socket.write_all(resp.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

async fn read_request(socket: &mut TcpStream) -> Result<Request> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            bail!("request headers exceed {MAX_HEADER_BYTES} bytes");
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed mid-request");
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let first = lines.next().unwrap_or("");
    let mut parts = first.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts
        .next()
        .unwrap_or("/")
        .split('?')
        .next()
        .unwrap_or("/")
        .to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.trim().parse::<usize>())
        .transpose()
        .context("invalid content-length")?
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        bail!("request body of {content_length} bytes exceeds {MAX_BODY_BYTES}");
    }
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed mid-body");
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(Request { method, path, body })
}

async fn route(request: &Request, service: &dyn PushService, log: &dyn MailboxLog) -> Reply {
    if request.method != "POST" {
        return (405, error_body("only POST is served"));
    }
    if request.path == APPEND_PATH {
        return append(&request.body, log).await;
    }
    let Some(route) = PushRoute::from_path(&request.path) else {
        return (404, error_body("not found"));
    };
    let outcome = match route {
        PushRoute::Private => match decode::<ChatMessage>(&request.body) {
            Ok(body) => {
                service
                    .push_private_message(body.position, body.target, body.payload)
                    .await
            }
            Err(reply) => return reply,
        },
        PushRoute::Group => match decode::<ChatMessage>(&request.body) {
            Ok(body) => {
                service
                    .push_group_message(body.position, body.target, body.payload)
                    .await
            }
            Err(reply) => return reply,
        },
        PushRoute::Roster => match decode::<GroupRoster>(&request.body) {
            Ok(body) => service.push_group_roster(body.position, body.payload).await,
            Err(reply) => return reply,
        },
        PushRoute::Count => match decode::<GroupCount>(&request.body) {
            Ok(body) => service.push_group_count(body.position, body.payload).await,
            Err(reply) => return reply,
        },
        PushRoute::Online => match decode::<Presence>(&request.body) {
            Ok(body) => {
                service
                    .push_presence_online(body.position, body.target, body.payload)
                    .await
            }
            Err(reply) => return reply,
        },
        PushRoute::Offline => match decode::<Presence>(&request.body) {
            Ok(body) => {
                service
                    .push_presence_offline(body.position, body.target, body.payload)
                    .await
            }
            Err(reply) => return reply,
        },
    };
    match outcome {
        Ok(()) => (200, "{\"status\":\"ok\"}".to_string()),
        Err(err) => (503, error_body(&err.to_string())),
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<PushBody<T>, Reply> {
    serde_json::from_slice(body).map_err(|err| (400, error_body(&format!("invalid body: {err}"))))
}

async fn append(body: &[u8], log: &dyn MailboxLog) -> Reply {
    let request: AppendRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => return (400, error_body(&format!("invalid body: {err}"))),
    };
    if request.op.is_group() != request.mailbox.is_group() {
        return (
            400,
            error_body(&format!(
                "{} cannot be appended to {}",
                request.op.label(),
                request.mailbox
            )),
        );
    }
    let payload = match Envelope::from_parts(request.op, request.payload).and_then(|e| e.encode())
    {
        Ok(payload) => payload,
        Err(err) => return (400, error_body(&err.to_string())),
    };
    match log.append(request.mailbox, payload).await {
        Ok(position) => {
            tracing::debug!("appended {} at {position}", request.op.label());
            match serde_json::to_string(&AppendResponse { position }) {
                Ok(body) => (200, body),
                Err(err) => (500, error_body(&err.to_string())),
            }
        }
        Err(err) => (503, error_body(&err.to_string())),
    }
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

/// [`PushService`] for a gateway instance in another process.
#[derive(Clone)]
pub struct RemotePushClient {
    instance_id: String,
    base_url: String,
    http: reqwest::Client,
}

impl RemotePushClient {
    pub fn new(instance_id: impl Into<String>, address: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!("failed to build push plane client: {err:?}");
                reqwest::Client::new()
            });
        Self {
            instance_id: instance_id.into(),
            base_url: base_url(address),
            http,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        operation: &'static str,
        body: &B,
    ) -> Result<reqwest::Response, PushError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|err| {
                PushError::unavailable(
                    self.instance_id.clone(),
                    operation,
                    format!("send failed: {err}"),
                )
            })?;
        if !response.status().is_success() {
            return Err(PushError::unavailable(
                self.instance_id.clone(),
                operation,
                format!("status {}", response.status()),
            ));
        }
        Ok(response)
    }

    async fn push<T: Serialize + Send + Sync>(
        &self,
        route: PushRoute,
        position: LogPosition,
        target: u64,
        payload: T,
    ) -> Result<(), PushError> {
        let body = PushBody {
            position,
            target,
            payload,
        };
        self.post(route.path(), route.operation(), &body).await?;
        Ok(())
    }

    /// Append an envelope to a mailbox through the peer's log.
    pub async fn append(&self, request: &AppendRequest) -> Result<AppendResponse, PushError> {
        let response = self.post(APPEND_PATH, "append", request).await?;
        response.json().await.map_err(|err| {
            PushError::unavailable(
                self.instance_id.clone(),
                "append",
                format!("decode failed: {err}"),
            )
        })
    }
}

fn base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[async_trait]
impl PushService for RemotePushClient {
    async fn push_private_message(
        &self,
        position: LogPosition,
        recipient: u64,
        message: ChatMessage,
    ) -> Result<(), PushError> {
        self.push(PushRoute::Private, position, recipient, message)
            .await
    }

    async fn push_group_message(
        &self,
        position: LogPosition,
        group_id: u64,
        message: ChatMessage,
    ) -> Result<(), PushError> {
        self.push(PushRoute::Group, position, group_id, message)
            .await
    }

    async fn push_group_roster(
        &self,
        position: LogPosition,
        roster: GroupRoster,
    ) -> Result<(), PushError> {
        let group_id = roster.group_id;
        self.push(PushRoute::Roster, position, group_id, roster)
            .await
    }

    async fn push_group_count(
        &self,
        position: LogPosition,
        count: GroupCount,
    ) -> Result<(), PushError> {
        let group_id = count.group_id;
        self.push(PushRoute::Count, position, group_id, count).await
    }

    async fn push_presence_online(
        &self,
        position: LogPosition,
        recipient: u64,
        presence: Presence,
    ) -> Result<(), PushError> {
        self.push(PushRoute::Online, position, recipient, presence)
            .await
    }

    async fn push_presence_offline(
        &self,
        position: LogPosition,
        recipient: u64,
        presence: Presence,
    ) -> Result<(), PushError> {
        self.push(PushRoute::Offline, position, recipient, presence)
            .await
    }
}
