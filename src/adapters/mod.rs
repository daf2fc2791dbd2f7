/// External adapter contracts.
///
/// The transport core never talks to the network directly — it consumes two
/// narrow adapters: the connected backend (record CRUD plus a realtime
/// change feed) and the mesh radio (discovery plus raw payload exchange).
/// Both are opaque async collaborators whose every call may fail; failures
/// are wrapped and handed to the resilience queue by the router.
///
/// Radio absence on a device is a first-class state, not a runtime null:
/// [`MeshRadio`] is `Available(handle) | Unavailable`, and availability is
/// observable synchronously via [`MeshRadio::is_available`] rather than only
/// by a failed send.
use std::sync::Arc;

use async_trait::async_trait;

use crate::gossip::GossipRecord;

#[cfg(test)]
pub mod mock;

// ---------------------------------------------------------------------------
// Subscription tokens
// ---------------------------------------------------------------------------

/// Handle for an event subscription. Cancels on [`Subscription::unsubscribe`]
/// or on drop; adapters without the underlying capability hand out
/// [`Subscription::noop`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn noop() -> Self {
        Subscription { cancel: None }
    }

    /// Explicitly cancel the subscription.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Connected backend
// ---------------------------------------------------------------------------

/// Listing inserted or updated on the backend.
pub type ChangeCallback = Box<dyn Fn(GossipRecord) + Send + Sync>;
/// Listing deleted on the backend (by record id).
pub type RemovalCallback = Box<dyn Fn(&str) + Send + Sync>;

/// The internet-reachable backend. All methods are opaque async calls that
/// may fail; the change feed delivers inserts/updates/deletes until its
/// subscription is cancelled.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    async fn fetch_records(&self) -> anyhow::Result<Vec<GossipRecord>>;

    async fn create_record(&self, record: &GossipRecord) -> anyhow::Result<()>;

    async fn update_record_status(&self, record_id: &str, status: &str) -> anyhow::Result<()>;

    fn subscribe_changes(
        &self,
        on_insert: ChangeCallback,
        on_update: ChangeCallback,
        on_delete: RemovalCallback,
    ) -> Subscription;
}

// ---------------------------------------------------------------------------
// Mesh radio
// ---------------------------------------------------------------------------

/// Raw payload arrived from an endpoint: `(endpoint_id, bytes)`.
pub type PayloadCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;
/// A nearby endpoint appeared or vanished (by endpoint id).
pub type EndpointCallback = Box<dyn Fn(&str) + Send + Sync>;

/// The local peer-to-peer radio. `is_available` answers synchronously so
/// callers can route around an absent radio instead of discovering the
/// absence through a failed send.
#[async_trait]
pub trait MeshAdapter: Send + Sync {
    fn is_available(&self) -> bool;

    async fn start_advertising(&self, name: &str) -> anyhow::Result<()>;

    async fn start_discovery(&self) -> anyhow::Result<()>;

    async fn stop_all(&self) -> anyhow::Result<()>;

    /// Send to one endpoint.
    async fn send_payload(&self, endpoint_id: &str, bytes: &[u8]) -> anyhow::Result<()>;

    /// Radio-level broadcast to whoever is listening.
    async fn broadcast_payload(&self, bytes: &[u8]) -> anyhow::Result<()>;

    fn on_payload_received(&self, callback: PayloadCallback) -> Subscription;

    fn on_endpoint_found(&self, callback: EndpointCallback) -> Subscription;

    fn on_endpoint_lost(&self, callback: EndpointCallback) -> Subscription;
}

/// Capability-checked handle to the mesh radio.
#[derive(Clone)]
pub enum MeshRadio {
    Available(Arc<dyn MeshAdapter>),
    /// No radio capability on this device or platform.
    Unavailable,
}

impl MeshRadio {
    /// True when a radio is present *and* currently usable.
    pub fn is_available(&self) -> bool {
        match self {
            MeshRadio::Available(adapter) => adapter.is_available(),
            MeshRadio::Unavailable => false,
        }
    }

    pub fn adapter(&self) -> Option<&Arc<dyn MeshAdapter>> {
        match self {
            MeshRadio::Available(adapter) => Some(adapter),
            MeshRadio::Unavailable => None,
        }
    }
}
