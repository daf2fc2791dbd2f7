//! # MeshMarket Transport Core
//!
//! **Transport routing and resilience for offline-first listing exchange.**
//!
//! MeshMarket peers trade short-lived listings with whoever is nearby, over
//! two interchangeable channels: the internet-reachable backend when there
//! is connectivity, and a local peer-to-peer mesh when there is not. This
//! crate is the layer that decides which channel carries each message,
//! queues and retries what cannot be delivered, keeps presence beacons
//! within the radio's payload budget, and merges gossip-propagated records
//! arriving over multiple mesh hops — with zero data loss across
//! transitions between the two modes.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`heartbeat`] | Bounded-size presence beacon codec |
//! | [`ledger`] | Bounded failure log with resolution tracking |
//! | [`queue`] | Priority-ordered retry queue, direct and deferred paths |
//! | [`router`] | Channel selection, fan-out, handler dispatch |
//! | [`gossip`] | Record dedup/merge, hop bounding, peer watermarks |
//! | [`modeswitch`] | Connected ⇄ LocalMesh transitions with replay |
//! | [`adapters`] | Contracts for the backend and mesh radio collaborators |
//! | [`config`] | Runtime-adjustable tunables |
//!
//! The screens, forms, and persistent listing store live elsewhere; they
//! observe delivery through [`queue::QueueStats`] and the ledger rather
//! than through raw errors.

// Crate-level lint configuration — suppress stylistic warnings that don't
// affect correctness.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

pub mod adapters;
pub mod config;
pub mod error;
pub mod gossip;
pub mod heartbeat;
pub mod ledger;
pub mod modeswitch;
pub mod queue;
pub mod router;

// ── Re-export main types ────────────────────────────────────────────────────
pub use adapters::{BackendAdapter, MeshAdapter, MeshRadio, Subscription};
pub use config::{ConfigHandle, TransportConfig};
pub use error::TransportError;
pub use gossip::{GossipEngine, GossipRecord, MergeOutcome, PriorityClass};
pub use heartbeat::{EncodedHeartbeat, HeartbeatPayload};
pub use ledger::{ErrorEntry, LedgerHandle, LedgerStats, OperationContext};
pub use modeswitch::{ConnectivityProbe, ConnectivityState, ModeController, ModeHandle};
pub use queue::{QueueStats, ResilienceQueue};
pub use router::{
    BroadcastOutcome, Channel, MessageEnvelope, MessageKind, MessagePayload, PeerDirectory,
    SendResult, TransportRouter,
};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version
pub fn get_version() -> &'static str {
    VERSION
}
