/// Presence beacon codec.
///
/// Peers announce themselves on the mesh with a tiny heartbeat beacon. The
/// wire format is a single JSON object wrapped under the well-known key
/// `"hb"`, giving a constant envelope overhead:
///
/// ```text
/// {"hb":{"version":1,"peerId":"…","timestamp":1724572800000,"capabilities":3}}
/// ```
///
/// The mesh radio rejects payloads of 1024 bytes or more, so the encoded
/// size is a hard external contract: for any peer id up to 64 characters the
/// encoding stays strictly below [`MAX_BEACON_BYTES`]. Encoding an oversized
/// beacon still succeeds (the size is reported to the caller, who refuses to
/// send it); decoding anything structurally incomplete yields `None`, never
/// a partial payload.
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Hard upper bound from the mesh radio's payload limit (exclusive).
pub const MAX_BEACON_BYTES: usize = 1024;

/// Longest peer id the size guarantee covers.
pub const MAX_PEER_ID_CHARS: usize = 64;

/// Current beacon format version.
pub const HEARTBEAT_VERSION: u32 = 1;

// Capability bits advertised in the beacon bitmask.
/// Peer relays gossip records for others.
pub const CAP_RELAY: u32 = 1 << 0;
/// Peer can bridge records to the connected backend when it regains internet.
pub const CAP_BACKEND_BRIDGE: u32 = 1 << 1;
/// Peer is on a constrained power budget; send sparingly.
pub const CAP_LOW_POWER: u32 = 1 << 2;

/// One presence beacon. Never mutated after creation — each beacon sent is a
/// fresh value from the presence driver.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub version: u32,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    /// Capability bitmask (`CAP_*` constants).
    pub capabilities: u32,
}

impl HeartbeatPayload {
    /// Fresh beacon stamped with the current wall clock.
    pub fn now(peer_id: impl Into<String>, capabilities: u32) -> Self {
        HeartbeatPayload {
            version: HEARTBEAT_VERSION,
            peer_id: peer_id.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            capabilities,
        }
    }

    pub fn has_capability(&self, bit: u32) -> bool {
        self.capabilities & bit != 0
    }
}

/// Result of encoding a beacon. `size` is reported even when it breaches the
/// radio limit — refusing to send is the caller's responsibility.
pub struct EncodedHeartbeat {
    pub bytes: Vec<u8>,
    pub size: usize,
}

impl EncodedHeartbeat {
    /// True when the beacon fits the mesh radio's payload limit.
    pub fn fits(&self) -> bool {
        self.size < MAX_BEACON_BYTES
    }
}

/// Wire wrapper — the single well-known top-level key.
#[derive(Serialize, Deserialize)]
struct BeaconWire {
    hb: HeartbeatPayload,
}

/// Encode a beacon to its JSON wire form.
///
/// Oversized beacons encode successfully but emit a warning; the caller must
/// check [`EncodedHeartbeat::fits`] before handing the bytes to the radio.
pub fn encode(payload: &HeartbeatPayload) -> Result<EncodedHeartbeat, TransportError> {
    let bytes = serde_json::to_vec(&BeaconWire {
        hb: payload.clone(),
    })
    .map_err(|e| TransportError::EncodeFailed(e.to_string()))?;
    let size = bytes.len();

    if size >= MAX_BEACON_BYTES {
        log::warn!(
            "⚠️  heartbeat for peer '{}' encodes to {} bytes (limit {}), will be refused by the radio",
            payload.peer_id,
            size,
            MAX_BEACON_BYTES
        );
    }

    Ok(EncodedHeartbeat { bytes, size })
}

/// Decode a beacon from its wire form.
///
/// Returns `None` for anything structurally incomplete: missing or mistyped
/// version, peer id, timestamp, or capabilities field.
pub fn decode(bytes: &[u8]) -> Option<HeartbeatPayload> {
    let wire: BeaconWire = serde_json::from_slice(bytes).ok()?;
    Some(wire.hb)
}
