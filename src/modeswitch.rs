/// Mode switch controller — observes connectivity, re-homes the router
/// between the connected and mesh channels, and replays pending state across
/// every transition.
///
/// State machine: **Connected ⇄ LocalMesh**, passing through a transient
/// **Switching** state on every transition. Connectivity is sampled on a
/// fixed cadence; a transition fires only once the new state has actually
/// been observed.
///
/// - Entering LocalMesh: stop the backend change feed, wire up and start
///   mesh advertising/discovery, then drain the resilience queue over the
///   mesh channel.
/// - Leaving LocalMesh: stop the radio, flush every locally known gossip
///   record to the backend, resume the change feed, then drain the queue.
///
/// A transition does not complete until its flush/replay step finishes or
/// definitively fails — failed flushes become queued operations, so nothing
/// present at the start of a transition is lost by its end.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::adapters::{BackendAdapter, MeshRadio, Subscription};
use crate::config::ConfigHandle;
use crate::gossip::GossipEngine;
use crate::heartbeat;
use crate::ledger::OperationContext;
use crate::queue::boxed_action;
use crate::router::{Channel, HandlerToken, TransportRouter};

// ---------------------------------------------------------------------------
// Connectivity state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Backend reachable; the connected channel is primary.
    Connected,
    /// No internet; the mesh channel is primary.
    LocalMesh,
    /// Mid-transition. Sends route to the mesh/queue until it completes.
    Switching,
}

/// Shared view of the current mode. The controller is the only writer; the
/// router reads it on every send.
#[derive(Clone)]
pub struct ModeHandle {
    state: Arc<RwLock<ConnectivityState>>,
}

impl ModeHandle {
    pub fn new(initial: ConnectivityState) -> Self {
        ModeHandle {
            state: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self) -> ConnectivityState {
        *self.state.read().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectivityState::Connected
    }

    pub(crate) fn set(&self, state: ConnectivityState) {
        *self.state.write().unwrap() = state;
    }
}

/// How the controller asks "is the internet there?". Injected so platforms
/// (and tests) supply their own reachability check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct ControllerInner {
    config: ConfigHandle,
    mode: ModeHandle,
    state_tx: watch::Sender<ConnectivityState>,
    router: TransportRouter,
    gossip: GossipEngine,
    backend: Arc<dyn BackendAdapter>,
    mesh: MeshRadio,
    probe: Arc<dyn ConnectivityProbe>,
    /// Name advertised to nearby peers.
    device_name: String,
    backend_sub: Mutex<Option<Subscription>>,
    mesh_subs: Mutex<Vec<Subscription>>,
    listing_handler: Mutex<Option<HandlerToken>>,
    running: AtomicBool,
}

#[derive(Clone)]
pub struct ModeController {
    inner: Arc<ControllerInner>,
}

impl ModeController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigHandle,
        mode: ModeHandle,
        router: TransportRouter,
        gossip: GossipEngine,
        backend: Arc<dyn BackendAdapter>,
        mesh: MeshRadio,
        probe: Arc<dyn ConnectivityProbe>,
        device_name: impl Into<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(mode.get());
        let controller = ModeController {
            inner: Arc::new(ControllerInner {
                config,
                mode,
                state_tx,
                router,
                gossip,
                backend,
                mesh,
                probe,
                device_name: device_name.into(),
                backend_sub: Mutex::new(None),
                mesh_subs: Mutex::new(Vec::new()),
                listing_handler: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        };
        // Incoming listings from either channel merge into the gossip store.
        let token = controller.inner.gossip.attach();
        *controller.inner.listing_handler.lock().unwrap() = Some(token);
        controller
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.mode.get()
    }

    /// Stream of state transitions, for the UI layer.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectivityState) {
        self.inner.mode.set(state);
        self.inner.state_tx.send_replace(state);
    }

    /// Align with the actual connectivity once, then pull the backend's
    /// current records into the local store when reachable.
    pub async fn start(&self) {
        if self.inner.probe.is_online().await {
            self.set_state(ConnectivityState::Connected);
            self.resume_backend_subscription();
            match self.inner.backend.fetch_records().await {
                Ok(records) => {
                    let n = records.len();
                    for record in records {
                        self.inner.gossip.absorb(record);
                    }
                    log::info!("✓ initial sync: {} records from backend", n);
                }
                Err(e) => {
                    log::warn!("initial fetch failed: {}", e);
                    let ctx = OperationContext {
                        attempt: 1,
                        last_error: Some(e.to_string()),
                        ..OperationContext::new("fetch_records")
                    };
                    self.inner.router.queue().ledger().record(ctx);
                }
            }
        } else {
            self.enter_local_mesh().await;
        }
    }

    /// Sampling loop. Runs until [`ModeController::stop`]; spawn it.
    pub async fn run(&self) {
        self.inner.running.store(true, Ordering::Relaxed);
        while self.inner.running.load(Ordering::Relaxed) {
            let interval = self.inner.config.get().sampling_interval_ms;
            tokio::time::sleep(Duration::from_millis(interval)).await;
            self.sample_once().await;
        }
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
    }

    /// Full teardown: stop sampling, cancel every live subscription, and
    /// detach the listing handler from the router.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(sub) = self.inner.backend_sub.lock().unwrap().take() {
            sub.unsubscribe();
        }
        for sub in self.inner.mesh_subs.lock().unwrap().drain(..) {
            sub.unsubscribe();
        }
        if let Some(token) = self.inner.listing_handler.lock().unwrap().take() {
            self.inner.router.unregister(token);
        }
    }

    /// One connectivity sample; transitions when the observed state differs
    /// from the current mode. No flapping protection beyond the cadence.
    pub async fn sample_once(&self) {
        let online = self.inner.probe.is_online().await;
        match (self.inner.mode.get(), online) {
            (ConnectivityState::Connected, false) => self.enter_local_mesh().await,
            (ConnectivityState::LocalMesh, true) => self.leave_local_mesh().await,
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Connected → LocalMesh.
    pub async fn enter_local_mesh(&self) {
        log::info!("connectivity lost, switching to local mesh");
        self.set_state(ConnectivityState::Switching);

        if let Some(sub) = self.inner.backend_sub.lock().unwrap().take() {
            sub.unsubscribe();
        }

        match self.inner.mesh.adapter() {
            Some(adapter) if adapter.is_available() => {
                self.wire_mesh_events(adapter);
                if let Err(e) = adapter.start_advertising(&self.inner.device_name).await {
                    log::warn!("start_advertising failed: {}", e);
                    self.ledger_transition_failure("start_advertising", &e);
                }
                if let Err(e) = adapter.start_discovery().await {
                    log::warn!("start_discovery failed: {}", e);
                    self.ledger_transition_failure("start_discovery", &e);
                }
            }
            _ => {
                // Store-and-forward only: everything queues until either
                // channel comes back.
                log::warn!("⚠️  mesh adapter unavailable on this device");
            }
        }

        // Resume delivering whatever was left pending, now over the mesh.
        let replayed = self.inner.router.queue().drain().await;
        if replayed > 0 {
            log::info!("✓ replayed {} pending operations over mesh", replayed);
        }
        self.set_state(ConnectivityState::LocalMesh);
    }

    /// LocalMesh → Connected. Blocks until every locally known record has
    /// been flushed to the backend or queued for retry.
    pub async fn leave_local_mesh(&self) {
        log::info!("connectivity restored, switching to backend");
        self.set_state(ConnectivityState::Switching);

        for sub in self.inner.mesh_subs.lock().unwrap().drain(..) {
            sub.unsubscribe();
        }
        if let Some(adapter) = self.inner.mesh.adapter() {
            if let Err(e) = adapter.stop_all().await {
                log::warn!("stop_all failed: {}", e);
            }
        }

        let records = self.inner.gossip.all_records();
        let total = records.len();
        let mut flushed = 0;
        let mut queued = 0;
        for record in records {
            match self.inner.backend.create_record(&record).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    let ctx = OperationContext {
                        attempt: 1,
                        last_error: Some(e.to_string()),
                        ..OperationContext::new(format!("flush:{}", record.id))
                    };
                    self.inner.router.queue().ledger().record(ctx);

                    let backend = self.inner.backend.clone();
                    let retry = record.clone();
                    self.inner.router.queue().enqueue(
                        boxed_action(move || {
                            let backend = backend.clone();
                            let record = retry.clone();
                            async move { backend.create_record(&record).await }
                        }),
                        OperationContext::new(format!("flush:{}", record.id)),
                        record.priority_class.base_priority(),
                    );
                    queued += 1;
                }
            }
        }
        log::info!(
            "✓ flush complete: {}/{} records delivered, {} queued for retry",
            flushed,
            total,
            queued
        );

        self.resume_backend_subscription();
        self.inner.gossip.prune_watermarks();
        // The router routes by mode, so flip before replaying the queue over
        // the connected channel.
        self.set_state(ConnectivityState::Connected);
        let replayed = self.inner.router.queue().drain().await;
        if replayed > 0 {
            log::info!("✓ replayed {} pending operations over backend", replayed);
        }
    }

    // -----------------------------------------------------------------------
    // Wiring
    // -----------------------------------------------------------------------

    fn wire_mesh_events(&self, adapter: &Arc<dyn crate::adapters::MeshAdapter>) {
        let router = self.inner.router.clone();
        let payload_sub = adapter.on_payload_received(Box::new(move |endpoint_id, bytes| {
            // Beacons double as identity: bind the stable peer id to this
            // endpoint before normal dispatch.
            if let Some(beacon) = heartbeat::decode(bytes) {
                router.peers().identify(endpoint_id, &beacon.peer_id);
            }
            router.handle_incoming(bytes, Channel::Mesh);
        }));

        let gossip = self.inner.gossip.clone();
        let queue = self.inner.router.queue().clone();
        let peers = self.inner.router.peers().clone();
        let found_sub = adapter.on_endpoint_found(Box::new(move |endpoint_id| {
            peers.endpoint_found(endpoint_id);
            // Offer the newcomer everything it has not seen. Runs on the
            // next drain; failures retry like any queued operation.
            let gossip = gossip.clone();
            let peers = peers.clone();
            let endpoint = endpoint_id.to_string();
            queue.enqueue(
                boxed_action(move || {
                    let gossip = gossip.clone();
                    let peers = peers.clone();
                    let endpoint = endpoint.clone();
                    async move {
                        let sync_key = peers
                            .get(&endpoint)
                            .map(|p| p.sync_key().to_string())
                            .unwrap_or_else(|| endpoint.clone());
                        gossip.offer_to_peer(&endpoint, &sync_key).await?;
                        Ok(())
                    }
                }),
                OperationContext::new(format!("offer:{}", endpoint_id)),
                2,
            );
        }));

        let peers = self.inner.router.peers().clone();
        let lost_sub = adapter.on_endpoint_lost(Box::new(move |endpoint_id| {
            peers.endpoint_lost(endpoint_id);
        }));

        *self.inner.mesh_subs.lock().unwrap() = vec![payload_sub, found_sub, lost_sub];
    }

    fn resume_backend_subscription(&self) {
        let on_insert = {
            let gossip = self.inner.gossip.clone();
            Box::new(move |record| {
                gossip.absorb(record);
            })
        };
        let on_update = {
            let gossip = self.inner.gossip.clone();
            Box::new(move |record| {
                gossip.absorb(record);
            })
        };
        let on_delete = Box::new(|record_id: &str| {
            log::debug!("backend deleted record {}", record_id);
        });
        let sub = self
            .inner
            .backend
            .subscribe_changes(on_insert, on_update, on_delete);
        *self.inner.backend_sub.lock().unwrap() = Some(sub);
    }

    fn ledger_transition_failure(&self, operation: &str, error: &anyhow::Error) {
        let ctx = OperationContext {
            attempt: 1,
            last_error: Some(error.to_string()),
            ..OperationContext::new(operation)
        };
        self.inner.router.queue().ledger().record(ctx);
    }
}
