use super::connection::{Connection, Delivery};
use super::group::{GroupError, GroupNode, Removal};
use crate::ops::metrics::SwitchboardMetrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Copy)]
pub struct BucketOptions {
    /// Broadcast fan-out workers per bucket.
    pub workers: usize,
    /// Pending broadcasts per worker before new ones are dropped.
    pub worker_queue_depth: usize,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            workers: 32,
            worker_queue_depth: 20,
        }
    }
}

/// A group-addressed delivery queued for local fan-out.
#[derive(Debug, Clone)]
pub struct GroupBroadcast {
    pub group_id: u64,
    pub delivery: Delivery,
}

#[derive(Default)]
struct Maps {
    connections: HashMap<u64, Arc<Connection>>,
    groups: HashMap<u64, Arc<GroupNode>>,
}

struct Shared {
    index: usize,
    maps: RwLock<Maps>,
    metrics: Arc<SwitchboardMetrics>,
}

impl Shared {
    fn fan_out(&self, broadcast: GroupBroadcast) {
        let op = broadcast.delivery.envelope.op();
        if !op.is_group() {
            tracing::warn!(
                "bucket {} ignoring {} broadcast for group {}",
                self.index,
                op.label(),
                broadcast.group_id
            );
            return;
        }
        let node = self.maps.read().groups.get(&broadcast.group_id).cloned();
        let Some(node) = node else {
            return;
        };
        node.for_each_member(|conn| {
            if let Err(err) = conn.offer(broadcast.delivery.clone()) {
                self.metrics.fanout_dropped();
                tracing::debug!(
                    "bucket {} dropped {} for recipient {}: {err}",
                    self.index,
                    broadcast.delivery.position,
                    conn.recipient_id()
                );
            }
        });
    }
}

/// One shard of the connection registry.
///
/// The shard lock only guards insertion and removal of ids in the two maps;
/// splicing members in and out of a located [`GroupNode`] takes that node's
/// own lock.
pub struct Bucket {
    shared: Arc<Shared>,
    workers: Vec<mpsc::Sender<GroupBroadcast>>,
    next_worker: AtomicUsize,
}

impl Bucket {
    /// Create the bucket and spawn its fan-out workers on the current runtime.
    pub fn new(index: usize, options: BucketOptions, metrics: Arc<SwitchboardMetrics>) -> Self {
        let shared = Arc::new(Shared {
            index,
            maps: RwLock::new(Maps::default()),
            metrics,
        });
        let workers = (0..options.workers.max(1))
            .map(|_| {
                let (tx, mut rx) = mpsc::channel::<GroupBroadcast>(options.worker_queue_depth.max(1));
                let shared = shared.clone();
                tokio::spawn(async move {
                    while let Some(broadcast) = rx.recv().await {
                        shared.fan_out(broadcast);
                    }
                });
                tx
            })
            .collect();
        Self {
            shared,
            workers,
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Register an authenticated connection and link it into its groups.
    pub fn assign_connection(&self, conn: &Arc<Connection>, group_ids: &[u64]) {
        let recipient = conn.recipient_id();
        let mut groups = group_ids.to_vec();
        groups.sort_unstable();
        groups.dedup();

        let nodes: Vec<Arc<GroupNode>> = {
            let mut maps = self.shared.maps.write();
            if let Some(previous) = maps.connections.insert(recipient, conn.clone()) {
                if !Arc::ptr_eq(&previous, conn) {
                    tracing::info!(
                        "bucket {} replaced session {} of recipient {recipient}",
                        self.shared.index,
                        previous.session_id()
                    );
                }
            }
            groups
                .iter()
                .map(|group_id| {
                    maps.groups
                        .entry(*group_id)
                        .or_insert_with(|| Arc::new(GroupNode::new(*group_id)))
                        .clone()
                })
                .collect()
        };
        conn.mark_registered();

        for mut node in nodes {
            loop {
                match node.put(conn.clone()) {
                    Ok(handle) => {
                        conn.add_membership(node, handle);
                        break;
                    }
                    Err(GroupError::Dropped(group_id)) => {
                        node = self.replace_dropped(group_id, &node);
                    }
                    Err(err) => {
                        tracing::error!(
                            "bucket {} failed to link recipient {recipient}: {err}",
                            self.shared.index
                        );
                        break;
                    }
                }
            }
        }
    }

    /// A dropped node may still be mapped while its remover waits for the
    /// shard lock; swap in a fresh node unless someone already did.
    fn replace_dropped(&self, group_id: u64, stale: &Arc<GroupNode>) -> Arc<GroupNode> {
        let mut maps = self.shared.maps.write();
        let current = maps
            .groups
            .get(&group_id)
            .filter(|node| !Arc::ptr_eq(node, stale))
            .cloned();
        if let Some(current) = current {
            return current;
        }
        let fresh = Arc::new(GroupNode::new(group_id));
        maps.groups.insert(group_id, fresh.clone());
        fresh
    }

    /// Unregister a connection and unlink it from every group it joined.
    ///
    /// Returns false, touching nothing, when the connection is not registered.
    pub fn remove_connection(&self, conn: &Arc<Connection>) -> bool {
        if !conn.take_registration() {
            return false;
        }
        let recipient = conn.recipient_id();
        {
            let mut maps = self.shared.maps.write();
            let current = maps
                .connections
                .get(&recipient)
                .is_some_and(|mapped| Arc::ptr_eq(mapped, conn));
            if current {
                maps.connections.remove(&recipient);
            }
        }
        for membership in conn.take_memberships() {
            let node = membership.node;
            match node.remove(membership.handle) {
                Ok(Removal::Emptied) => {
                    let group_id = node.group_id();
                    let mut maps = self.shared.maps.write();
                    let mapped = maps
                        .groups
                        .get(&group_id)
                        .is_some_and(|current| Arc::ptr_eq(current, &node));
                    if mapped {
                        maps.groups.remove(&group_id);
                    }
                }
                Ok(Removal::Remaining(_)) => {}
                Err(err) => {
                    tracing::error!(
                        "bucket {} failed to unlink recipient {recipient}: {err}",
                        self.shared.index
                    );
                }
            }
        }
        true
    }

    /// Queue a group delivery for one of the fan-out workers.
    ///
    /// Never waits: a full worker queue drops the broadcast and the pump's
    /// confirmation timeout re-delivers it.
    pub fn broadcast(&self, broadcast: GroupBroadcast) -> bool {
        let slot = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        match self.workers[slot].try_send(broadcast) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                self.shared.metrics.broadcast_dropped();
                tracing::warn!(
                    "bucket {} worker {slot} full; dropped {} for group {}",
                    self.shared.index,
                    dropped.delivery.position,
                    dropped.group_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Offer a delivery to one local recipient without waiting.
    pub fn deliver_to(&self, recipient: u64, delivery: Delivery) -> bool {
        let Some(conn) = self.get_connection(recipient) else {
            return false;
        };
        match conn.offer(delivery) {
            Ok(()) => true,
            Err(err) => {
                self.shared.metrics.fanout_dropped();
                tracing::debug!(
                    "bucket {} could not queue for recipient {recipient}: {err}",
                    self.shared.index
                );
                false
            }
        }
    }

    pub fn get_connection(&self, recipient: u64) -> Option<Arc<Connection>> {
        self.shared.maps.read().connections.get(&recipient).cloned()
    }

    pub fn get_group_node(&self, group_id: u64) -> Option<Arc<GroupNode>> {
        self.shared.maps.read().groups.get(&group_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.maps.read().connections.len()
    }

    pub fn group_count(&self) -> usize {
        self.shared.maps.read().groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{ChatMessage, Envelope, GroupCount, LogPosition, MailboxId};
    use crate::registry::{Outbound, QueueDepths};
    use std::time::Duration;

    fn bucket() -> Bucket {
        Bucket::new(
            0,
            BucketOptions {
                workers: 2,
                worker_queue_depth: 8,
            },
            Arc::new(SwitchboardMetrics::default()),
        )
    }

    fn session(recipient: u64) -> (Arc<Connection>, Outbound) {
        let (conn, outbound) = Connection::new(QueueDepths {
            messages: 4,
            statuses: 4,
        });
        conn.set_recipient_id(recipient);
        (conn, outbound)
    }

    fn group_chat(group_id: u64, offset: u64) -> GroupBroadcast {
        GroupBroadcast {
            group_id,
            delivery: Delivery::new(
                MailboxId::group(group_id),
                LogPosition::new(MailboxId::group(group_id).topic(), 0, offset),
                Envelope::GroupMessage(ChatMessage {
                    message_id: format!("g{group_id}-{offset}"),
                    from: 1,
                    target: group_id,
                    content: "hello group".into(),
                    message_type: String::new(),
                    from_name: String::new(),
                    created_at: String::new(),
                }),
            ),
        }
    }

    #[tokio::test]
    async fn assign_and_remove_maintain_group_nodes() {
        let bucket = bucket();
        let (a, _qa) = session(1);
        let (b, _qb) = session(2);
        bucket.assign_connection(&a, &[7, 8, 7]);
        bucket.assign_connection(&b, &[7]);
        assert_eq!(bucket.get_group_node(7).unwrap().online_count(), 2);
        assert_eq!(bucket.get_group_node(8).unwrap().online_count(), 1);
        assert_eq!(a.group_ids().len(), 2);

        assert!(bucket.remove_connection(&a));
        assert!(bucket.get_connection(1).is_none());
        assert!(bucket.get_group_node(8).is_none());
        let seven = bucket.get_group_node(7).unwrap();
        assert_eq!(seven.online_count(), 1);

        assert!(bucket.remove_connection(&b));
        assert!(seven.is_dropped());
        assert!(bucket.get_group_node(7).is_none());
        assert_eq!(bucket.group_count(), 0);
    }

    #[tokio::test]
    async fn removing_unregistered_connection_is_noop() {
        let bucket = bucket();
        let (member, _qm) = session(1);
        bucket.assign_connection(&member, &[7]);
        let (stranger, _qs) = session(2);
        assert!(!bucket.remove_connection(&stranger));
        assert_eq!(bucket.get_group_node(7).unwrap().online_count(), 1);
        assert!(bucket.get_connection(1).is_some());
        assert!(bucket.remove_connection(&member));
        assert!(!bucket.remove_connection(&member));
    }

    #[tokio::test]
    async fn put_after_drop_gets_fresh_node() {
        let bucket = bucket();
        let (a, _qa) = session(1);
        bucket.assign_connection(&a, &[7]);
        let first = bucket.get_group_node(7).unwrap();
        bucket.remove_connection(&a);
        assert!(first.is_dropped());

        let (b, _qb) = session(2);
        bucket.assign_connection(&b, &[7]);
        let second = bucket.get_group_node(7).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.online_count(), 1);
        assert_eq!(first.online_count(), 0);
    }

    #[tokio::test]
    async fn dropped_node_left_in_map_is_replaced() {
        let bucket = bucket();
        let stale = Arc::new(GroupNode::new(7));
        let (ghost, _qg) = session(99);
        let handle = stale.put(ghost).unwrap();
        stale.remove(handle).unwrap();
        bucket.shared.maps.write().groups.insert(7, stale.clone());

        let (a, _qa) = session(1);
        bucket.assign_connection(&a, &[7]);
        let live = bucket.get_group_node(7).unwrap();
        assert!(!Arc::ptr_eq(&live, &stale));
        assert_eq!(live.online_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_keeps_newest_session_mapped() {
        let bucket = bucket();
        let (old, _qo) = session(5);
        let (new, _qn) = session(5);
        bucket.assign_connection(&old, &[7]);
        bucket.assign_connection(&new, &[7]);
        assert!(bucket.remove_connection(&old));
        let mapped = bucket.get_connection(5).unwrap();
        assert!(Arc::ptr_eq(&mapped, &new));
        assert_eq!(bucket.get_group_node(7).unwrap().online_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_each_member_once_and_skips_full_queues() {
        let bucket = bucket();
        let (a, mut qa) = session(1);
        let (b, mut qb) = session(2);
        let (c, _qc) = session(3);
        bucket.assign_connection(&a, &[7]);
        bucket.assign_connection(&b, &[7]);
        bucket.assign_connection(&c, &[7]);
        for offset in 0..4 {
            c.offer(group_chat(9, 100 + offset).delivery).unwrap();
        }

        assert!(bucket.broadcast(group_chat(7, 0)));
        let first = tokio::time::timeout(Duration::from_secs(1), qa.messages.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), qb.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.position.offset, 0);
        assert_eq!(second.position.offset, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(qa.messages.try_recv().is_err());
        assert!(qb.messages.try_recv().is_err());
        assert_eq!(bucket.shared.metrics.snapshot().fanout_dropped_total, 1);
    }

    #[tokio::test]
    async fn status_broadcasts_use_status_queue() {
        let bucket = bucket();
        let (a, mut qa) = session(1);
        bucket.assign_connection(&a, &[7]);
        let delivery = Delivery::new(
            MailboxId::group(7),
            LogPosition::new("group_chat_7", 0, 3),
            Envelope::GroupCount(GroupCount {
                group_id: 7,
                online_count: 1,
            }),
        );
        bucket.broadcast(GroupBroadcast {
            group_id: 7,
            delivery,
        });
        let got = tokio::time::timeout(Duration::from_secs(1), qa.statuses.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.envelope.op(), crate::mailbox::OpCode::GroupCount);
        assert!(qa.messages.try_recv().is_err());
    }
}
