use super::session::serve_connection;
use super::Gateway;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Bind the client listener and accept sessions until shutdown flips.
pub async fn start_listener(
    bind: &str,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind client listener on {bind}"))?;
    let local = listener.local_addr()?;
    tracing::info!("{} accepting clients on {local}", gateway.instance_id());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        if let Err(err) = socket.set_nodelay(true) {
                            tracing::debug!("nodelay on {peer} failed: {err:?}");
                        }
                        let gateway = gateway.clone();
                        tokio::spawn(serve_connection(gateway, socket, peer.to_string()));
                    }
                    Err(err) => {
                        tracing::warn!("client accept error: {err:?}");
                    }
                },
            }
        }
        tracing::info!("client listener on {local} stopped");
    });
    Ok(local)
}
