/// Directory of nearby mesh endpoints, fed by the radio's endpoint
/// found/lost events.
///
/// An endpoint id is a radio session handle; the stable identity arrives
/// later in the peer's heartbeat. Gossip watermarks key off the stable id
/// when known, so a peer reconnecting under a fresh endpoint id keeps its
/// sync history.
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub endpoint_id: String,
    /// Stable peer id learned from the heartbeat, once seen.
    pub peer_id: Option<String>,
    pub found_at_ms: i64,
    pub last_seen_ms: i64,
}

impl PeerInfo {
    /// Key used for sync watermarks: the stable id when known, otherwise the
    /// endpoint id.
    pub fn sync_key(&self) -> &str {
        self.peer_id.as_deref().unwrap_or(&self.endpoint_id)
    }
}

#[derive(Default)]
pub struct PeerDirectory {
    peers: Mutex<HashMap<String, PeerInfo>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint_found(&self, endpoint_id: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut peers = self.peers.lock().unwrap();
        peers
            .entry(endpoint_id.to_string())
            .and_modify(|p| p.last_seen_ms = now)
            .or_insert_with(|| {
                log::info!("mesh endpoint found: {}", endpoint_id);
                PeerInfo {
                    endpoint_id: endpoint_id.to_string(),
                    peer_id: None,
                    found_at_ms: now,
                    last_seen_ms: now,
                }
            });
    }

    pub fn endpoint_lost(&self, endpoint_id: &str) {
        if self.peers.lock().unwrap().remove(endpoint_id).is_some() {
            log::info!("mesh endpoint lost: {}", endpoint_id);
        }
    }

    /// Attach the stable peer id learned from a heartbeat.
    pub fn identify(&self, endpoint_id: &str, peer_id: &str) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(peer) = peers.get_mut(endpoint_id) {
            if peer.peer_id.as_deref() != Some(peer_id) {
                log::debug!("endpoint {} identified as peer {}", endpoint_id, peer_id);
                peer.peer_id = Some(peer_id.to_string());
            }
            peer.last_seen_ms = chrono::Utc::now().timestamp_millis();
        }
    }

    pub fn get(&self, endpoint_id: &str) -> Option<PeerInfo> {
        self.peers.lock().unwrap().get(endpoint_id).cloned()
    }

    pub fn list(&self) -> Vec<PeerInfo> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.peers.lock().unwrap().clear();
    }
}
