/// In-memory adapter fakes for exercising the routing and mode-switch logic
/// without a radio or a backend.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    BackendAdapter, ChangeCallback, EndpointCallback, MeshAdapter, PayloadCallback,
    RemovalCallback, Subscription,
};
use crate::gossip::GossipRecord;

type CallbackMap<T> = Arc<Mutex<HashMap<u64, T>>>;

fn subscribe<T>(map: &CallbackMap<T>, next_id: &AtomicU64, callback: T) -> Subscription
where
    T: Send + 'static,
{
    let id = next_id.fetch_add(1, Ordering::Relaxed);
    map.lock().unwrap().insert(id, callback);
    let map = map.clone();
    Subscription::new(move || {
        map.lock().unwrap().remove(&id);
    })
}

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockMeshAdapter {
    pub available: AtomicBool,
    pub advertising: Mutex<Option<String>>,
    pub discovering: AtomicBool,
    pub stopped: AtomicBool,
    /// Per-endpoint sends: (endpoint_id, bytes).
    pub sent: Mutex<Vec<(String, Vec<u8>)>>,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
    /// Endpoints whose sends fail.
    pub failing_endpoints: Mutex<HashSet<String>>,
    pub fail_broadcast: AtomicBool,
    payload_callbacks: CallbackMap<PayloadCallback>,
    found_callbacks: CallbackMap<EndpointCallback>,
    lost_callbacks: CallbackMap<EndpointCallback>,
    next_sub: AtomicU64,
}

impl MockMeshAdapter {
    pub fn available() -> Arc<Self> {
        let mesh = Self::default();
        mesh.available.store(true, Ordering::Relaxed);
        Arc::new(mesh)
    }

    pub fn fail_endpoint(&self, endpoint_id: &str) {
        self.failing_endpoints
            .lock()
            .unwrap()
            .insert(endpoint_id.to_string());
    }

    pub fn emit_payload(&self, endpoint_id: &str, bytes: &[u8]) {
        let callbacks: Vec<_> = {
            let map = self.payload_callbacks.lock().unwrap();
            map.keys().copied().collect()
        };
        for id in callbacks {
            let map = self.payload_callbacks.lock().unwrap();
            if let Some(cb) = map.get(&id) {
                cb(endpoint_id, bytes);
            }
        }
    }

    pub fn emit_endpoint_found(&self, endpoint_id: &str) {
        for cb in self.found_callbacks.lock().unwrap().values() {
            cb(endpoint_id);
        }
    }

    pub fn emit_endpoint_lost(&self, endpoint_id: &str) {
        for cb in self.lost_callbacks.lock().unwrap().values() {
            cb(endpoint_id);
        }
    }

    pub fn payload_subscriber_count(&self) -> usize {
        self.payload_callbacks.lock().unwrap().len()
    }
}

#[async_trait]
impl MeshAdapter for MockMeshAdapter {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn start_advertising(&self, name: &str) -> anyhow::Result<()> {
        *self.advertising.lock().unwrap() = Some(name.to_string());
        self.stopped.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn start_discovery(&self) -> anyhow::Result<()> {
        self.discovering.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop_all(&self) -> anyhow::Result<()> {
        self.advertising.lock().unwrap().take();
        self.discovering.store(false, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn send_payload(&self, endpoint_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        if self.failing_endpoints.lock().unwrap().contains(endpoint_id) {
            anyhow::bail!("endpoint {} unreachable", endpoint_id);
        }
        self.sent
            .lock()
            .unwrap()
            .push((endpoint_id.to_string(), bytes.to_vec()));
        Ok(())
    }

    async fn broadcast_payload(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if self.fail_broadcast.load(Ordering::Relaxed) {
            anyhow::bail!("broadcast failed");
        }
        self.broadcasts.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn on_payload_received(&self, callback: PayloadCallback) -> Subscription {
        subscribe(&self.payload_callbacks, &self.next_sub, callback)
    }

    fn on_endpoint_found(&self, callback: EndpointCallback) -> Subscription {
        subscribe(&self.found_callbacks, &self.next_sub, callback)
    }

    fn on_endpoint_lost(&self, callback: EndpointCallback) -> Subscription {
        subscribe(&self.lost_callbacks, &self.next_sub, callback)
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockBackendAdapter {
    pub remote: Mutex<Vec<GossipRecord>>,
    pub created: Mutex<Vec<GossipRecord>>,
    pub status_updates: Mutex<Vec<(String, String)>>,
    pub fail_create: AtomicBool,
    /// Ids whose create calls fail (partial-failure scenarios).
    pub failing_record_ids: Mutex<HashSet<String>>,
    pub subscribed: Arc<AtomicBool>,
    insert_callback: Mutex<Option<ChangeCallback>>,
}

impl MockBackendAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_record(&self, record_id: &str) {
        self.failing_record_ids
            .lock()
            .unwrap()
            .insert(record_id.to_string());
    }

    /// Simulate the realtime feed delivering an insert.
    pub fn emit_insert(&self, record: GossipRecord) {
        if let Some(cb) = self.insert_callback.lock().unwrap().as_ref() {
            cb(record);
        }
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect()
    }
}

#[async_trait]
impl BackendAdapter for MockBackendAdapter {
    async fn fetch_records(&self) -> anyhow::Result<Vec<GossipRecord>> {
        Ok(self.remote.lock().unwrap().clone())
    }

    async fn create_record(&self, record: &GossipRecord) -> anyhow::Result<()> {
        if self.fail_create.load(Ordering::Relaxed)
            || self.failing_record_ids.lock().unwrap().contains(&record.id)
        {
            anyhow::bail!("backend rejected record {}", record.id);
        }
        self.created.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn update_record_status(&self, record_id: &str, status: &str) -> anyhow::Result<()> {
        if self.fail_create.load(Ordering::Relaxed) {
            anyhow::bail!("backend rejected status update for {}", record_id);
        }
        self.status_updates
            .lock()
            .unwrap()
            .push((record_id.to_string(), status.to_string()));
        Ok(())
    }

    fn subscribe_changes(
        &self,
        on_insert: ChangeCallback,
        _on_update: ChangeCallback,
        _on_delete: RemovalCallback,
    ) -> Subscription {
        *self.insert_callback.lock().unwrap() = Some(on_insert);
        self.subscribed.store(true, Ordering::Relaxed);
        let subscribed = self.subscribed.clone();
        Subscription::new(move || {
            subscribed.store(false, Ordering::Relaxed);
        })
    }
}
