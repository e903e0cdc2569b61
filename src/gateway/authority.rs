//! Credential validation and session bookkeeping outside the gateway.

use crate::config::LocalToken;
use crate::coord::CoordinationStore;
use crate::mailbox::{Envelope, GroupCount, MailboxId, MailboxLog, Presence};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a successful authentication tells the gateway about the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGrant {
    pub recipient_id: u64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub group_ids: Vec<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential rejected: {0}")]
    Rejected(String),
    #[error("session authority unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Validate `credential` and record that `instance_id` now hosts the recipient.
    async fn authenticate(&self, credential: &str, instance_id: &str)
        -> Result<AuthGrant, AuthError>;

    async fn disconnect(&self, recipient_id: u64) -> Result<(), AuthError>;
}

/// Business-service authority reached over HTTP.
#[derive(Clone)]
pub struct HttpSessionAuthority {
    endpoint: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest<'a> {
    access_token: &'a str,
    instance_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectRequest {
    recipient_id: u64,
}

impl HttpSessionAuthority {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!("failed to build session authority client: {err:?}");
                reqwest::Client::new()
            });
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            format!("{}{path}", self.endpoint)
        } else {
            format!("http://{}{path}", self.endpoint)
        }
    }
}

#[async_trait]
impl SessionAuthority for HttpSessionAuthority {
    async fn authenticate(
        &self,
        credential: &str,
        instance_id: &str,
    ) -> Result<AuthGrant, AuthError> {
        let response = self
            .http
            .post(self.url("/v1/sessions/connect"))
            .json(&ConnectRequest {
                access_token: credential,
                instance_id,
            })
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(format!("connect send failed: {err}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AuthError::Rejected(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(AuthError::Unavailable(format!("connect status {status}")));
        }
        response
            .json()
            .await
            .map_err(|err| AuthError::Unavailable(format!("connect decode failed: {err}")))
    }

    async fn disconnect(&self, recipient_id: u64) -> Result<(), AuthError> {
        let response = self
            .http
            .post(self.url("/v1/sessions/disconnect"))
            .json(&DisconnectRequest { recipient_id })
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(format!("disconnect send failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AuthError::Unavailable(format!(
                "disconnect status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Authority backed by a static token table.
///
/// Besides validating tokens it keeps the coordination store's online
/// registry current and announces the change: a count update to each joined
/// group's mailbox and a presence update to each friend's mailbox.
pub struct LocalSessionAuthority {
    by_token: HashMap<String, LocalToken>,
    by_recipient: HashMap<u64, LocalToken>,
    coord: Arc<dyn CoordinationStore>,
    log: Arc<dyn MailboxLog>,
}

impl LocalSessionAuthority {
    pub fn new(
        tokens: Vec<LocalToken>,
        coord: Arc<dyn CoordinationStore>,
        log: Arc<dyn MailboxLog>,
    ) -> Self {
        let by_recipient = tokens
            .iter()
            .map(|token| (token.recipient_id, token.clone()))
            .collect();
        let by_token = tokens
            .into_iter()
            .map(|token| (token.token.clone(), token))
            .collect();
        Self {
            by_token,
            by_recipient,
            coord,
            log,
        }
    }

    async fn announce(&self, entry: &LocalToken, online: bool) {
        for group_id in &entry.groups {
            let online_count = match self.coord.group_online_count(*group_id).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!("group {group_id} count unavailable: {err:?}");
                    continue;
                }
            };
            let update = Envelope::GroupCount(GroupCount {
                group_id: *group_id,
                online_count,
            });
            self.append(MailboxId::group(*group_id), &update).await;
        }
        let presence = Presence {
            who: entry.recipient_id,
            display_name: entry.display_name.clone(),
        };
        for friend in &entry.friends {
            let update = if online {
                Envelope::PresenceOnline(presence.clone())
            } else {
                Envelope::PresenceOffline(presence.clone())
            };
            self.append(MailboxId::user(*friend), &update).await;
        }
    }

    async fn append(&self, mailbox: MailboxId, envelope: &Envelope) {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("cannot encode {} for {mailbox}: {err:?}", envelope.op().label());
                return;
            }
        };
        if let Err(err) = self.log.append(mailbox, payload).await {
            tracing::warn!("append {} to {mailbox} failed: {err:?}", envelope.op().label());
        }
    }
}

#[async_trait]
impl SessionAuthority for LocalSessionAuthority {
    async fn authenticate(
        &self,
        credential: &str,
        instance_id: &str,
    ) -> Result<AuthGrant, AuthError> {
        let entry = self
            .by_token
            .get(credential)
            .ok_or_else(|| AuthError::Rejected("unknown access token".into()))?;
        self.coord
            .mark_online(entry.recipient_id, instance_id, &entry.groups)
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        tracing::info!(
            "recipient {} online at {instance_id} in {} groups",
            entry.recipient_id,
            entry.groups.len()
        );
        self.announce(entry, true).await;
        Ok(AuthGrant {
            recipient_id: entry.recipient_id,
            display_name: entry.display_name.clone(),
            group_ids: entry.groups.clone(),
        })
    }

    async fn disconnect(&self, recipient_id: u64) -> Result<(), AuthError> {
        let Some(entry) = self.by_recipient.get(&recipient_id) else {
            return Ok(());
        };
        self.coord
            .mark_offline(recipient_id, &entry.groups)
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        tracing::info!("recipient {recipient_id} offline");
        self.announce(entry, false).await;
        Ok(())
    }
}
