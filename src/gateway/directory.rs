use super::push::PushService;
use super::rpc::RemotePushClient;
use crate::delivery::InstanceResolver;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Maps gateway instance ids to something that can push to them.
///
/// The local instance resolves to the in-process gateway; every other id
/// resolves to a push-plane client.
pub struct InstanceDirectory {
    local_id: String,
    local: Arc<dyn PushService>,
    peers: RwLock<HashMap<String, Arc<dyn PushService>>>,
}

impl InstanceDirectory {
    pub fn new(local_id: impl Into<String>, local: Arc<dyn PushService>) -> Self {
        Self {
            local_id: local_id.into(),
            local,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a push-plane client for every configured peer.
    pub fn with_remote_peers(self, peers: &BTreeMap<String, String>, timeout: Duration) -> Self {
        for (instance_id, address) in peers {
            let client = RemotePushClient::new(instance_id.clone(), address, timeout);
            self.insert_peer(instance_id.clone(), Arc::new(client));
        }
        self
    }

    pub fn insert_peer(&self, instance_id: impl Into<String>, service: Arc<dyn PushService>) {
        self.peers.write().insert(instance_id.into(), service);
    }

    pub fn remove_peer(&self, instance_id: &str) -> bool {
        self.peers.write().remove(instance_id).is_some()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl InstanceResolver for InstanceDirectory {
    fn resolve(&self, instance_id: &str) -> Option<Arc<dyn PushService>> {
        if instance_id == self.local_id {
            return Some(self.local.clone());
        }
        self.peers.read().get(instance_id).cloned()
    }
}
