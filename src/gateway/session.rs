//! Per-connection read and write loops.
//!
//! Frames are newline-delimited JSON. The first client frame must carry an
//! access token; everything after it only renews the heartbeat deadline.

use super::authority::{AuthError, AuthGrant};
use super::Gateway;
use crate::archive::ArchivedMessage;
use crate::coord::AckOutcome;
use crate::registry::{Connection, Delivery, Outbound};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    /// Longest silence tolerated from the client, including before authentication.
    pub pong_wait: Duration,
    pub archive_flush: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: 8192,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            archive_flush: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
enum ClientFrame {
    Authenticate {
        #[serde(rename = "accessToken")]
        access_token: String,
    },
    Pong,
}

#[derive(Debug, Serialize)]
#[serde(tag = "control", rename_all = "snake_case")]
enum ControlFrame<'a> {
    Authenticated {
        #[serde(rename = "recipientId")]
        recipient_id: u64,
    },
    Rejected {
        reason: &'a str,
    },
    Ping,
}

#[derive(Debug, thiserror::Error)]
enum FrameError {
    #[error("frame io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {0} bytes")]
    TooLong(usize),
    #[error("write timed out")]
    WriteTimeout,
    #[error("frame encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("no credential within the heartbeat window")]
    AuthTimeout,
    #[error("closed before authenticating")]
    Closed,
    #[error("first frame must authenticate")]
    ExpectedCredential,
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Read one newline-terminated frame, refusing lines over `max` bytes.
async fn read_frame<R>(
    reader: &mut BufReader<R>,
    buf: &mut String,
    max: usize,
) -> Result<Option<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    // Room for the frame plus a CRLF terminator.
    let limit = max as u64 + 2;
    let read = (&mut *reader).take(limit).read_line(buf).await?;
    if read == 0 {
        return Ok(None);
    }
    let truncated = !buf.ends_with('\n') && read as u64 == limit;
    let line = buf.trim_end_matches(['\r', '\n']);
    if truncated || line.len() > max {
        return Err(FrameError::TooLong(max));
    }
    Ok(Some(line.to_string()))
}

struct FrameSink<W> {
    writer: W,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> FrameSink<W> {
    async fn send_line(&mut self, line: &str) -> Result<(), FrameError> {
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        let writer = &mut self.writer;
        timeout(self.write_timeout, async move {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| FrameError::WriteTimeout)??;
        Ok(())
    }

    async fn control(&mut self, frame: &ControlFrame<'_>) -> Result<(), FrameError> {
        let line = serde_json::to_string(frame)?;
        self.send_line(&line).await
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Serve one client connection until either loop ends.
pub async fn serve_connection<S>(gateway: Arc<Gateway>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let options = gateway.options().session;
    let metrics = gateway.metrics().clone();
    metrics.connection_opened();

    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut sink = FrameSink {
        writer: write_half,
        write_timeout: options.write_timeout,
    };
    let (conn, outbound) = Connection::new(gateway.options().queues);

    let grant = match authenticate(&gateway, &mut reader).await {
        Ok(grant) => grant,
        Err(err) => {
            metrics.auth_failed();
            tracing::info!("session {} from {peer} rejected: {err}", conn.session_id());
            let reason = err.to_string();
            let _ = sink
                .control(&ControlFrame::Rejected { reason: &reason })
                .await;
            sink.close().await;
            metrics.connection_closed();
            return;
        }
    };

    conn.set_recipient_id(grant.recipient_id);
    gateway
        .bucket(grant.recipient_id)
        .assign_connection(&conn, &grant.group_ids);
    tracing::info!(
        "session {} from {peer} authenticated as {} in {} groups",
        conn.session_id(),
        grant.recipient_id,
        grant.group_ids.len()
    );

    let stop = CancellationToken::new();
    if let Err(err) = sink
        .control(&ControlFrame::Authenticated {
            recipient_id: grant.recipient_id,
        })
        .await
    {
        tracing::debug!("session {} lost before greeting: {err}", conn.session_id());
        stop.cancel();
    }
    let writer = tokio::spawn(write_loop(
        gateway.clone(),
        conn.clone(),
        outbound,
        sink,
        stop.clone(),
    ));
    read_loop(&gateway, &conn, &mut reader, &stop).await;
    stop.cancel();
    if let Err(err) = writer.await {
        tracing::warn!("session {} write loop panicked: {err:?}", conn.session_id());
        finish_session(&gateway, &conn).await;
    }
    metrics.connection_closed();
}

async fn authenticate<R>(
    gateway: &Gateway,
    reader: &mut BufReader<R>,
) -> Result<AuthGrant, SessionError>
where
    R: AsyncRead + Unpin,
{
    let options = gateway.options().session;
    let mut buf = String::new();
    let line = timeout(
        options.pong_wait,
        read_frame(reader, &mut buf, options.max_frame_bytes),
    )
    .await
    .map_err(|_| SessionError::AuthTimeout)??
    .ok_or(SessionError::Closed)?;
    let Ok(ClientFrame::Authenticate { access_token }) = serde_json::from_str::<ClientFrame>(&line)
    else {
        return Err(SessionError::ExpectedCredential);
    };
    let grant = gateway
        .authority()
        .authenticate(&access_token, gateway.instance_id())
        .await?;
    if grant.recipient_id == 0 {
        return Err(AuthError::Rejected("authority granted recipient 0".into()).into());
    }
    Ok(grant)
}

async fn read_loop<R>(
    gateway: &Gateway,
    conn: &Connection,
    reader: &mut BufReader<R>,
    stop: &CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let options = gateway.options().session;
    let mut buf = String::new();
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return,
            frame = timeout(options.pong_wait, read_frame(reader, &mut buf, options.max_frame_bytes)) => frame,
        };
        match frame {
            Err(_) => {
                tracing::info!("session {} missed its heartbeat", conn.session_id());
                return;
            }
            Ok(Err(err)) => {
                tracing::info!("session {} read failed: {err}", conn.session_id());
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Ok(Some(line))) => match serde_json::from_str::<ClientFrame>(&line) {
                Ok(ClientFrame::Pong) => {}
                Ok(ClientFrame::Authenticate { .. }) => {
                    tracing::debug!("session {} re-sent credentials", conn.session_id());
                }
                Err(_) => {
                    tracing::trace!("session {} sent an application frame", conn.session_id());
                }
            },
        }
    }
}

async fn write_loop<W>(
    gateway: Arc<Gateway>,
    conn: Arc<Connection>,
    mut outbound: Outbound,
    mut sink: FrameSink<W>,
    stop: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let options = gateway.options().session;
    let mut ping = interval_at(Instant::now() + options.ping_interval, options.ping_interval);
    let mut flush = interval_at(Instant::now() + options.archive_flush, options.archive_flush);
    let mut pending: Vec<ArchivedMessage> = Vec::new();

    loop {
        let delivered = tokio::select! {
            _ = stop.cancelled() => break,
            delivery = outbound.messages.recv() => match delivery {
                Some(delivery) => deliver(&gateway, &mut sink, delivery, &mut pending).await,
                None => false,
            },
            delivery = outbound.statuses.recv() => match delivery {
                Some(delivery) => deliver(&gateway, &mut sink, delivery, &mut pending).await,
                None => false,
            },
            _ = flush.tick() => {
                flush_archive(&gateway, &mut pending).await;
                true
            }
            _ = ping.tick() => match sink.control(&ControlFrame::Ping).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::info!("session {} ping failed: {err}", conn.session_id());
                    false
                }
            },
        };
        if !delivered {
            break;
        }
    }

    stop.cancel();
    flush_archive(&gateway, &mut pending).await;
    sink.close().await;
    finish_session(&gateway, &conn).await;
}

/// Write one delivery and report its outcome toward the pump.
///
/// Returns false when the connection is no longer writable.
async fn deliver<W>(
    gateway: &Gateway,
    sink: &mut FrameSink<W>,
    delivery: Delivery,
    pending: &mut Vec<ArchivedMessage>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    let line = match delivery.envelope.encode_to_string() {
        Ok(line) => line,
        Err(err) => {
            tracing::warn!("cannot encode {}: {err:?}", delivery.position);
            return true;
        }
    };
    if let Err(err) = sink.send_line(&line).await {
        tracing::info!("write of {} failed: {err}", delivery.position);
        if let Err(err) = gateway
            .coord()
            .acknowledge(delivery.mailbox, &delivery.position, AckOutcome::Failed)
            .await
        {
            tracing::warn!("failure ack for {} lost: {err:?}", delivery.position);
        }
        return false;
    }
    confirm(gateway, &delivery, pending).await;
    true
}

async fn confirm(gateway: &Gateway, delivery: &Delivery, pending: &mut Vec<ArchivedMessage>) {
    let coord = gateway.coord();
    match coord.cursor(delivery.mailbox).await {
        Ok(Some(cursor)) if cursor.covers(&delivery.position) => {
            tracing::debug!("{} already confirmed at {cursor}", delivery.position);
            return;
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!("cursor check for {} failed: {err:?}", delivery.position);
        }
    }
    if let Some(message) = delivery.envelope.chat() {
        pending.push(ArchivedMessage::new(
            delivery.mailbox.kind,
            message,
            &delivery.position,
        ));
    }
    if let Err(err) = coord
        .acknowledge(delivery.mailbox, &delivery.position, AckOutcome::Delivered)
        .await
    {
        tracing::warn!("ack for {} lost: {err:?}", delivery.position);
    }
}

async fn flush_archive(gateway: &Gateway, pending: &mut Vec<ArchivedMessage>) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    let attempted = batch.len();
    match gateway.archive().store(batch).await {
        Ok(stored) => {
            gateway.metrics().archived(stored as u64);
            tracing::debug!("archived {stored} of {attempted} delivered messages");
        }
        Err(err) => tracing::warn!("archive flush of {attempted} messages failed: {err:?}"),
    }
}

/// Unregister an authenticated session exactly once.
async fn finish_session(gateway: &Gateway, conn: &Arc<Connection>) {
    if !conn.is_authenticated() {
        return;
    }
    let recipient = conn.recipient_id();
    let bucket = gateway.bucket(recipient);
    if !bucket.remove_connection(conn) {
        return;
    }
    // A newer session for the same recipient keeps it online.
    if bucket.get_connection(recipient).is_some() {
        tracing::info!(
            "session {} closed; recipient {recipient} still connected",
            conn.session_id()
        );
        return;
    }
    if let Err(err) = gateway.authority().disconnect(recipient).await {
        tracing::warn!("disconnect of recipient {recipient} failed: {err:?}");
    }
}
