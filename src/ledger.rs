/// Error/retry ledger — a bounded log of delivery failures with explicit
/// resolution tracking.
///
/// Every failed attempt (direct or queued) lands here, as does every drop
/// caused by retry exhaustion or capacity eviction, so no operation ever
/// disappears without a trace. Entries start unresolved; resolution is
/// explicit and monotonic — a resolved entry never reverts. When a capacity
/// is configured the oldest entries are evicted first, keeping the newest N.
///
/// The UI layer keys its "message queued / message failed" states off this
/// ledger (via [`LedgerHandle::stats`] and [`LedgerHandle::list`]), never off
/// raw errors.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::config::ConfigHandle;

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// What an operation was doing when it failed. Shared between the queue and
/// the ledger so a dropped operation's history reads end to end.
#[derive(Clone, Debug)]
pub struct OperationContext {
    pub operation_name: String,
    /// Milliseconds since the Unix epoch, stamped at the failing attempt.
    pub timestamp_ms: i64,
    /// 1-based attempt number of the failure.
    pub attempt: u32,
    pub last_error: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl OperationContext {
    pub fn new(operation_name: impl Into<String>) -> Self {
        OperationContext {
            operation_name: operation_name.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            attempt: 0,
            last_error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ErrorEntry {
    pub id: Uuid,
    pub context: OperationContext,
    pub resolved: bool,
    pub resolved_at_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerStats {
    pub total: usize,
    pub unresolved: usize,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

struct LedgerState {
    /// Oldest at the front, newest at the back.
    entries: VecDeque<ErrorEntry>,
}

/// Shared handle to the error ledger. Cheap to clone; all components that
/// record failures hold one.
#[derive(Clone)]
pub struct LedgerHandle {
    state: Arc<Mutex<LedgerState>>,
    config: ConfigHandle,
}

impl LedgerHandle {
    pub fn new(config: ConfigHandle) -> Self {
        LedgerHandle {
            state: Arc::new(Mutex::new(LedgerState {
                entries: VecDeque::new(),
            })),
            config,
        }
    }

    /// Record a failure. Returns the new entry's id.
    ///
    /// If the configured capacity is exceeded, the oldest entries are evicted
    /// to keep the newest N.
    pub fn record(&self, context: OperationContext) -> Uuid {
        let capacity = self.config.get().error_log_capacity;
        let id = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        state.entries.push_back(ErrorEntry {
            id,
            context,
            resolved: false,
            resolved_at_ms: None,
        });
        if let Some(cap) = capacity {
            while state.entries.len() > cap {
                state.entries.pop_front();
            }
        }
        id
    }

    /// Entries ordered most-recent-first, optionally limited.
    pub fn list(&self, limit: Option<usize>) -> Vec<ErrorEntry> {
        let state = self.state.lock().unwrap();
        let iter = state.entries.iter().rev().cloned();
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Unresolved entries, most-recent-first.
    pub fn list_unresolved(&self) -> Vec<ErrorEntry> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .rev()
            .filter(|e| !e.resolved)
            .cloned()
            .collect()
    }

    /// Mark an entry resolved. No-op (never an error) for unknown ids;
    /// already-resolved entries keep their original resolution time.
    pub fn resolve(&self, entry_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == entry_id) {
            if !entry.resolved {
                entry.resolved = true;
                entry.resolved_at_ms = Some(chrono::Utc::now().timestamp_millis());
                log::debug!("✓ ledger entry {} resolved", entry_id);
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        let n = state.entries.len();
        state.entries.clear();
        log::debug!("ledger cleared ({} entries)", n);
    }

    /// Cap the ledger, evicting oldest entries immediately if needed.
    /// `None` removes the cap. Writes through to the live configuration.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.config.update(|c| c.error_log_capacity = capacity);
        if let Some(cap) = capacity {
            let mut state = self.state.lock().unwrap();
            while state.entries.len() > cap {
                state.entries.pop_front();
            }
        }
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.state.lock().unwrap();
        LedgerStats {
            total: state.entries.len(),
            unresolved: state.entries.iter().filter(|e| !e.resolved).count(),
        }
    }
}
