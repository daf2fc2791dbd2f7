/// Gossip merge engine — deduplicates and merges listing records arriving
/// over multiple mesh hops, bounds relay depth, and tracks per-peer sync
/// watermarks.
///
/// Per-record state machine:
///
/// ```text
/// Unknown ──receive──▶ Known(hop, body_ts) ──▶ re-broadcast | terminal at hop limit
/// ```
///
/// Merge rules:
/// - A record seen for the first time is stored with its hop count
///   incremented by exactly one, and relayed through the router iff the
///   result is within the configured hop limit. Records past the limit stay
///   locally known — they are never lost, only no longer relayed.
/// - A record already known merges last-writer-wins on `body_timestamp_ms`.
///   The stored hop count never decreases, and a newer body does not
///   re-increment the hop for the same hop.
/// - No record is ever discarded because a peer disappeared; everything
///   stays known and is offered to any newly discovered peer (which has no
///   watermark here yet).
///
/// Relaying goes through the resilience queue so a burst of inbound records
/// cannot wedge the receive path; the queue orders relays urgent-first, and
/// records that have waited past `priority_boost_after_ms` get a one-step
/// boost so offers cannot starve forever behind a continuous urgent stream.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::ConfigHandle;
use crate::ledger::OperationContext;
use crate::queue::boxed_action;
use crate::router::{
    Channel, HandlerToken, MessageEnvelope, MessageKind, MessagePayload, TransportRouter,
};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Listing urgency class. Variant order is relay order: urgent first.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PriorityClass {
    Urgent,
    Request,
    Offer,
}

impl PriorityClass {
    /// Base queue priority for this class (lower = more urgent). Presence
    /// and control traffic sits at 0, so classes start at 1.
    pub fn base_priority(self) -> u8 {
        match self {
            PriorityClass::Urgent => 1,
            PriorityClass::Request => 2,
            PriorityClass::Offer => 3,
        }
    }
}

/// One gossip-propagated listing. `body` is the user-facing listing content,
/// opaque to this layer; `body_timestamp_ms` is its last-edit time and the
/// LWW merge key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipRecord {
    pub id: String,
    pub priority_class: PriorityClass,
    /// Relays traversed since the origin. Incremented by exactly one per
    /// re-broadcast, never decremented.
    pub hop_count: u8,
    pub body_timestamp_ms: i64,
    pub body: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First sighting. `rebroadcast` is false once the incremented hop count
    /// exceeds the configured limit.
    New { rebroadcast: bool },
    /// Known id, newer body: stored copy replaced (hop count preserved).
    Updated,
    /// Known id, identical body timestamp: nothing to do.
    Duplicate,
    /// Known id, older body: incoming variant lost the merge.
    Stale,
}

#[derive(Clone, Debug)]
struct KnownRecord {
    record: GossipRecord,
    first_seen_ms: i64,
    last_changed_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct GossipInner {
    config: ConfigHandle,
    router: TransportRouter,
    known: Mutex<HashMap<String, KnownRecord>>,
    /// Peer sync key → last successful exchange, ms epoch.
    watermarks: Mutex<HashMap<String, i64>>,
}

#[derive(Clone)]
pub struct GossipEngine {
    inner: Arc<GossipInner>,
}

impl GossipEngine {
    pub fn new(config: ConfigHandle, router: TransportRouter) -> Self {
        GossipEngine {
            inner: Arc::new(GossipInner {
                config,
                router,
                known: Mutex::new(HashMap::new()),
                watermarks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register this engine as the router's listing handler. Incoming
    /// records merge immediately; relays are queued for the next drain.
    pub fn attach(&self) -> HandlerToken {
        let engine = self.clone();
        self.inner
            .router
            .register_handler(MessageKind::Listing, move |envelope| {
                if let MessagePayload::Listing(record) = &envelope.payload {
                    engine.handle_remote(record.clone());
                }
            })
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Merge a record received from a peer. Returns the outcome and, for
    /// fresh records, leaves the stored copy carrying the incremented hop.
    pub fn merge(&self, record: GossipRecord) -> MergeOutcome {
        self.merge_with_stored(record).0
    }

    fn merge_with_stored(&self, record: GossipRecord) -> (MergeOutcome, Option<GossipRecord>) {
        let max_hops = self.inner.config.get().max_hop_count;
        let now = now_ms();
        let mut known = self.inner.known.lock().unwrap();
        match known.entry(record.id.clone()) {
            Entry::Occupied(mut entry) => {
                let stored = entry.get_mut();
                if record.body_timestamp_ms > stored.record.body_timestamp_ms {
                    // LWW: newer body wins, hop count is preserved — the
                    // record did not travel again just because it was edited.
                    let hop = stored.record.hop_count;
                    stored.record = record;
                    stored.record.hop_count = hop;
                    stored.last_changed_ms = now;
                    log::debug!(
                        "gossip record {} updated (body_ts {})",
                        stored.record.id,
                        stored.record.body_timestamp_ms
                    );
                    (MergeOutcome::Updated, None)
                } else if record.body_timestamp_ms == stored.record.body_timestamp_ms {
                    (MergeOutcome::Duplicate, None)
                } else {
                    (MergeOutcome::Stale, None)
                }
            }
            Entry::Vacant(entry) => {
                let mut record = record;
                record.hop_count = record.hop_count.saturating_add(1);
                let rebroadcast = record.hop_count <= max_hops;
                if !rebroadcast {
                    log::debug!(
                        "gossip record {} at hop {} (limit {}), kept but not relayed",
                        record.id,
                        record.hop_count,
                        max_hops
                    );
                }
                let stored = record.clone();
                entry.insert(KnownRecord {
                    record,
                    first_seen_ms: now,
                    last_changed_ms: now,
                });
                (MergeOutcome::New { rebroadcast }, Some(stored))
            }
        }
    }

    /// Merge a record that arrived from the connected backend. No mesh hop
    /// was traversed, so the hop count is taken as-is and nothing is
    /// relayed; LWW applies as usual for known ids.
    pub fn absorb(&self, record: GossipRecord) -> MergeOutcome {
        let now = now_ms();
        let mut known = self.inner.known.lock().unwrap();
        match known.entry(record.id.clone()) {
            Entry::Occupied(mut entry) => {
                let stored = entry.get_mut();
                if record.body_timestamp_ms > stored.record.body_timestamp_ms {
                    let hop = stored.record.hop_count;
                    stored.record = record;
                    stored.record.hop_count = hop;
                    stored.last_changed_ms = now;
                    MergeOutcome::Updated
                } else if record.body_timestamp_ms == stored.record.body_timestamp_ms {
                    MergeOutcome::Duplicate
                } else {
                    MergeOutcome::Stale
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(KnownRecord {
                    record,
                    first_seen_ms: now,
                    last_changed_ms: now,
                });
                MergeOutcome::New { rebroadcast: false }
            }
        }
    }

    /// Merge a record from a peer and, when it is fresh and within the hop
    /// limit, queue its relay through the router at a class-derived priority.
    pub fn handle_remote(&self, record: GossipRecord) -> MergeOutcome {
        let (outcome, stored) = self.merge_with_stored(record);
        if let (MergeOutcome::New { rebroadcast: true }, Some(stored)) = (outcome, stored) {
            let priority = stored.priority_class.base_priority();
            let router = self.inner.router.clone();
            let record_id = stored.id.clone();
            let envelope =
                MessageEnvelope::new(MessagePayload::Listing(stored), Channel::Mesh);
            self.inner.router.queue().enqueue(
                boxed_action(move || {
                    let router = router.clone();
                    let envelope = envelope.clone();
                    async move {
                        router.broadcast(envelope).await;
                        Ok(())
                    }
                }),
                OperationContext::new(format!("relay:{}", record_id)),
                priority,
            );
        }
        outcome
    }

    /// Store a locally authored record (hop count 0) and broadcast it to
    /// every known peer immediately.
    pub async fn publish_local(&self, record: GossipRecord) {
        let now = now_ms();
        {
            let mut known = self.inner.known.lock().unwrap();
            known.insert(
                record.id.clone(),
                KnownRecord {
                    record: record.clone(),
                    first_seen_ms: now,
                    last_changed_ms: now,
                },
            );
        }
        log::info!("publishing local record {}", record.id);
        let envelope = MessageEnvelope::new(MessagePayload::Listing(record), Channel::Mesh);
        self.inner.router.broadcast(envelope).await;
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, record_id: &str) -> Option<GossipRecord> {
        self.inner
            .known
            .lock()
            .unwrap()
            .get(record_id)
            .map(|k| k.record.clone())
    }

    pub fn known_count(&self) -> usize {
        self.inner.known.lock().unwrap().len()
    }

    /// Every locally known record, most urgent first (with age boost).
    pub fn all_records(&self) -> Vec<GossipRecord> {
        let known = self.inner.known.lock().unwrap();
        let now = now_ms();
        let mut entries: Vec<&KnownRecord> = known.values().collect();
        entries.sort_by_key(|k| (self.effective_priority_at(k, now), k.first_seen_ms));
        entries.iter().map(|k| k.record.clone()).collect()
    }

    /// Queue priority of a known record right now: its class priority,
    /// boosted one step once the record has waited past the configured age.
    pub fn effective_priority(&self, record_id: &str) -> Option<u8> {
        let known = self.inner.known.lock().unwrap();
        let now = now_ms();
        known
            .get(record_id)
            .map(|k| self.effective_priority_at(k, now))
    }

    fn effective_priority_at(&self, known: &KnownRecord, now: i64) -> u8 {
        let base = known.record.priority_class.base_priority();
        let boost_after = self.inner.config.get().priority_boost_after_ms;
        if now.saturating_sub(known.first_seen_ms) >= boost_after {
            base.saturating_sub(1)
        } else {
            base
        }
    }

    // -----------------------------------------------------------------------
    // Per-peer sync
    // -----------------------------------------------------------------------

    /// Records this peer has not acknowledged yet, most urgent first. A peer
    /// with no watermark (newly discovered, or pruned) gets everything still
    /// within the relay hop limit.
    pub fn records_for_peer(&self, sync_key: &str) -> Vec<GossipRecord> {
        let watermark = self.watermark(sync_key);
        let max_hops = self.inner.config.get().max_hop_count;
        let known = self.inner.known.lock().unwrap();
        let now = now_ms();
        let mut due: Vec<&KnownRecord> = known
            .values()
            .filter(|k| k.record.hop_count <= max_hops)
            .filter(|k| match watermark {
                Some(mark) => k.last_changed_ms > mark,
                None => true,
            })
            .collect();
        due.sort_by_key(|k| (self.effective_priority_at(k, now), k.first_seen_ms));
        due.iter().map(|k| k.record.clone()).collect()
    }

    /// Push every due record to one endpoint, then advance its watermark.
    /// Any send failure aborts (the caller's queued operation retries) and
    /// leaves the watermark untouched.
    pub async fn offer_to_peer(&self, endpoint_id: &str, sync_key: &str) -> anyhow::Result<usize> {
        let due = self.records_for_peer(sync_key);
        if due.is_empty() {
            return Ok(0);
        }
        let total = due.len();
        for record in due {
            let envelope =
                MessageEnvelope::new(MessagePayload::Listing(record), Channel::Mesh);
            self.inner
                .router
                .send_to_peer(endpoint_id, &envelope)
                .await
                .map_err(anyhow::Error::new)?;
        }
        self.mark_synced(sync_key);
        log::info!("✓ offered {} records to peer {}", total, sync_key);
        Ok(total)
    }

    /// Record a successful exchange with a peer.
    pub fn mark_synced(&self, sync_key: &str) {
        self.mark_synced_at(sync_key, now_ms());
    }

    fn mark_synced_at(&self, sync_key: &str, at_ms: i64) {
        self.inner
            .watermarks
            .lock()
            .unwrap()
            .insert(sync_key.to_string(), at_ms);
    }

    pub fn watermark(&self, sync_key: &str) -> Option<i64> {
        self.inner.watermarks.lock().unwrap().get(sync_key).copied()
    }

    /// Drop watermarks for peers unseen past the configured TTL. A pruned
    /// peer that reappears simply gets a full offer, like a new peer.
    pub fn prune_watermarks(&self) -> usize {
        let ttl = self.inner.config.get().watermark_ttl_ms;
        let cutoff = now_ms() - ttl;
        let mut watermarks = self.inner.watermarks.lock().unwrap();
        let before = watermarks.len();
        watermarks.retain(|_, last| *last > cutoff);
        let pruned = before - watermarks.len();
        if pruned > 0 {
            log::debug!("pruned {} stale peer watermarks", pruned);
        }
        pruned
    }
}
