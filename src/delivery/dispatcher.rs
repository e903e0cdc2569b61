use crate::coord::{CoordError, CoordinationStore};
use crate::gateway::{PushError, PushService};
use crate::mailbox::{Envelope, LogPosition, MailboxId};
use crate::ops::metrics::SwitchboardMetrics;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Opaque "which push service reaches this instance" capability.
pub trait InstanceResolver: Send + Sync {
    fn resolve(&self, instance_id: &str) -> Option<Arc<dyn PushService>>;
}

/// Per-instance outcome of dispatching one record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Instances that accepted the push.
    pub pushed: Vec<String>,
    pub failed: Vec<String>,
    /// Recipients with no hosting instance.
    pub unresolved: Vec<u64>,
}

impl DispatchReport {
    pub fn reached_any(&self) -> bool {
        !self.pushed.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Coord(#[from] CoordError),
    #[error("{op} cannot be delivered from {mailbox}")]
    Misaddressed { op: &'static str, mailbox: MailboxId },
}

/// Resolves hosting instances for a fetched record and calls their push
/// operation.
pub struct Dispatcher {
    coord: Arc<dyn CoordinationStore>,
    resolver: Arc<dyn InstanceResolver>,
    metrics: Arc<SwitchboardMetrics>,
}

impl Dispatcher {
    pub fn new(
        coord: Arc<dyn CoordinationStore>,
        resolver: Arc<dyn InstanceResolver>,
        metrics: Arc<SwitchboardMetrics>,
    ) -> Self {
        Self {
            coord,
            resolver,
            metrics,
        }
    }

    pub async fn dispatch(
        &self,
        mailbox: MailboxId,
        position: &LogPosition,
        envelope: &Envelope,
    ) -> Result<DispatchReport, DispatchError> {
        if envelope.op().is_group() != mailbox.is_group() {
            return Err(DispatchError::Misaddressed {
                op: envelope.op().label(),
                mailbox,
            });
        }
        if mailbox.is_group() {
            self.dispatch_group(mailbox.id, position, envelope).await
        } else {
            self.dispatch_single(mailbox.id, position, envelope).await
        }
    }

    async fn dispatch_single(
        &self,
        recipient: u64,
        position: &LogPosition,
        envelope: &Envelope,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        let Some(instance) = self.coord.hosting_instance(recipient).await? else {
            self.unresolved(&mut report, recipient, position);
            return Ok(report);
        };
        let Some(service) = self.resolver.resolve(&instance) else {
            tracing::warn!("no push route to {instance} for {position}");
            self.metrics.push_failed();
            report.failed.push(instance);
            return Ok(report);
        };
        let position = position.clone();
        let result = match envelope {
            Envelope::PrivateMessage(message) => {
                service
                    .push_private_message(position, recipient, message.clone())
                    .await
            }
            Envelope::PresenceOnline(presence) => {
                service
                    .push_presence_online(position, recipient, presence.clone())
                    .await
            }
            Envelope::PresenceOffline(presence) => {
                service
                    .push_presence_offline(position, recipient, presence.clone())
                    .await
            }
            other => {
                return Err(DispatchError::Misaddressed {
                    op: other.op().label(),
                    mailbox: MailboxId::user(recipient),
                })
            }
        };
        self.record(&mut report, instance, result);
        Ok(report)
    }

    async fn dispatch_group(
        &self,
        group_id: u64,
        position: &LogPosition,
        envelope: &Envelope,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        let members = self.coord.group_online_members(group_id).await?;
        let mut instances = BTreeSet::new();
        for member in members {
            match self.coord.hosting_instance(member).await {
                Ok(Some(instance)) => {
                    instances.insert(instance);
                }
                Ok(None) => self.unresolved(&mut report, member, position),
                Err(err) => {
                    tracing::warn!("hosting lookup for {member} failed: {err:?}");
                    self.unresolved(&mut report, member, position);
                }
            }
        }

        let calls = instances.into_iter().map(|instance| async move {
            let result = match self.resolver.resolve(&instance) {
                Some(service) => {
                    push_group(service.as_ref(), position.clone(), group_id, envelope).await
                }
                None => Err(PushError::unavailable(
                    instance.clone(),
                    "resolve",
                    "no push route",
                )),
            };
            (instance, result)
        });
        for (instance, result) in join_all(calls).await {
            self.record(&mut report, instance, result);
        }
        Ok(report)
    }

    fn unresolved(&self, report: &mut DispatchReport, recipient: u64, position: &LogPosition) {
        self.metrics.recipient_unresolved();
        tracing::info!("recipient {recipient} of {position} has no hosting instance");
        report.unresolved.push(recipient);
    }

    fn record(&self, report: &mut DispatchReport, instance: String, result: Result<(), PushError>) {
        match result {
            Ok(()) => report.pushed.push(instance),
            Err(err) => {
                self.metrics.push_failed();
                tracing::warn!("push to {instance} failed: {err:?}");
                report.failed.push(instance);
            }
        }
    }
}

async fn push_group(
    service: &dyn PushService,
    position: LogPosition,
    group_id: u64,
    envelope: &Envelope,
) -> Result<(), PushError> {
    match envelope {
        Envelope::GroupMessage(message) => {
            service
                .push_group_message(position, group_id, message.clone())
                .await
        }
        Envelope::GroupRoster(roster) => service.push_group_roster(position, roster.clone()).await,
        Envelope::GroupCount(count) => service.push_group_count(position, count.clone()).await,
        // dispatch() already rejected non-group ops for group mailboxes
        _ => Ok(()),
    }
}
