use super::group::{GroupNode, MemberHandle};
use crate::mailbox::{Envelope, LogPosition, MailboxId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// One mailbox record on its way to a client.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub mailbox: MailboxId,
    pub position: LogPosition,
    pub envelope: Arc<Envelope>,
}

impl Delivery {
    pub fn new(mailbox: MailboxId, position: LogPosition, envelope: Envelope) -> Self {
        Self {
            mailbox,
            position,
            envelope: Arc::new(envelope),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueDepths {
    pub messages: usize,
    pub statuses: usize,
}

impl Default for QueueDepths {
    fn default() -> Self {
        Self {
            messages: 1024,
            statuses: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OfferError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// Receiving halves of a connection's outbound queues, owned by its write loop.
pub struct Outbound {
    pub messages: mpsc::Receiver<Delivery>,
    pub statuses: mpsc::Receiver<Delivery>,
}

pub(crate) struct Membership {
    pub(crate) node: Arc<GroupNode>,
    pub(crate) handle: MemberHandle,
}

/// A live client session as seen by the registry.
///
/// Chat frames and status frames (presence, roster, counts) use separate
/// bounded queues so a burst of one kind cannot starve the other. Group
/// memberships are kept as back-references for O(1) unlinking on disconnect;
/// they form reference cycles with the group nodes until
/// [`Bucket::remove_connection`](super::Bucket::remove_connection) clears them.
pub struct Connection {
    session_id: u64,
    recipient_id: AtomicU64,
    messages: mpsc::Sender<Delivery>,
    statuses: mpsc::Sender<Delivery>,
    registered: AtomicBool,
    memberships: Mutex<Vec<Membership>>,
}

impl Connection {
    pub fn new(depths: QueueDepths) -> (Arc<Self>, Outbound) {
        let (messages, message_rx) = mpsc::channel(depths.messages.max(1));
        let (statuses, status_rx) = mpsc::channel(depths.statuses.max(1));
        let conn = Arc::new(Self {
            session_id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            recipient_id: AtomicU64::new(0),
            messages,
            statuses,
            registered: AtomicBool::new(false),
            memberships: Mutex::new(Vec::new()),
        });
        let outbound = Outbound {
            messages: message_rx,
            statuses: status_rx,
        };
        (conn, outbound)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Zero until the session authenticated.
    pub fn recipient_id(&self) -> u64 {
        self.recipient_id.load(Ordering::Acquire)
    }

    pub fn set_recipient_id(&self, recipient_id: u64) {
        self.recipient_id.store(recipient_id, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.recipient_id() != 0
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    /// Clears the registered flag, returning whether it was set.
    pub(crate) fn take_registration(&self) -> bool {
        self.registered.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn add_membership(&self, node: Arc<GroupNode>, handle: MemberHandle) {
        self.memberships.lock().push(Membership { node, handle });
    }

    pub(crate) fn take_memberships(&self) -> Vec<Membership> {
        std::mem::take(&mut *self.memberships.lock())
    }

    pub fn group_ids(&self) -> Vec<u64> {
        self.memberships
            .lock()
            .iter()
            .map(|membership| membership.node.group_id())
            .collect()
    }

    /// Enqueue without waiting. Chat frames go to the message queue,
    /// everything else to the status queue.
    pub fn offer(&self, delivery: Delivery) -> Result<(), OfferError> {
        let queue = if delivery.envelope.op().is_chat() {
            &self.messages
        } else {
            &self.statuses
        };
        queue.try_send(delivery).map_err(|err| match err {
            TrySendError::Full(_) => OfferError::Full,
            TrySendError::Closed(_) => OfferError::Closed,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.session_id)
            .field("recipient_id", &self.recipient_id())
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{ChatMessage, Presence};

    fn chat_delivery(offset: u64) -> Delivery {
        Delivery::new(
            MailboxId::user(5),
            LogPosition::new("friend_chat_5", 0, offset),
            Envelope::PrivateMessage(ChatMessage {
                message_id: format!("m-{offset}"),
                from: 1,
                target: 5,
                content: "hi".into(),
                message_type: String::new(),
                from_name: String::new(),
                created_at: String::new(),
            }),
        )
    }

    #[test]
    fn routes_chat_and_status_to_separate_queues() {
        let (conn, mut outbound) = Connection::new(QueueDepths {
            messages: 4,
            statuses: 4,
        });
        conn.offer(chat_delivery(0)).unwrap();
        conn.offer(Delivery::new(
            MailboxId::user(5),
            LogPosition::new("friend_chat_5", 0, 1),
            Envelope::PresenceOffline(Presence {
                who: 9,
                display_name: String::new(),
            }),
        ))
        .unwrap();
        assert_eq!(outbound.messages.try_recv().unwrap().position.offset, 0);
        assert_eq!(outbound.statuses.try_recv().unwrap().position.offset, 1);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (conn, outbound) = Connection::new(QueueDepths {
            messages: 1,
            statuses: 1,
        });
        conn.offer(chat_delivery(0)).unwrap();
        assert_eq!(conn.offer(chat_delivery(1)), Err(OfferError::Full));
        drop(outbound);
        assert_eq!(conn.offer(chat_delivery(2)), Err(OfferError::Closed));
    }

    #[test]
    fn sessions_start_unauthenticated() {
        let (conn, _outbound) = Connection::new(QueueDepths::default());
        assert!(!conn.is_authenticated());
        conn.set_recipient_id(42);
        assert!(conn.is_authenticated());
        assert!(!conn.take_registration());
    }
}
