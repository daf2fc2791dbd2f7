/// Resilience queue — priority-ordered deferred operations with
/// retry-with-backoff execution.
///
/// Two execution paths share the same retry budget and ledger accounting:
///
/// - **Direct** ([`ResilienceQueue::execute_with_retry`]): attempt, sleep
///   the configured backoff, retry; after `max_retries` consecutive failures
///   the call surfaces [`TransportError::RetriesExhausted`] with the full
///   failure history.
/// - **Queued** ([`ResilienceQueue::enqueue`] + [`ResilienceQueue::drain`]):
///   one attempt per drain pass; a failed operation stays queued with its
///   retry count incremented until it has failed `max_retries` times total,
///   then it is dropped with a final ledger entry. The original caller has
///   already returned, so the drop is logged, not thrown.
///
/// Invariants:
/// - A drain pass processes entries in strictly ascending priority value;
///   ties preserve insertion order.
/// - Only one drain pass is logically active at a time — a `drain()` that
///   arrives mid-pass observes that pass's result instead of starting a
///   second one.
/// - Capacity overflow evicts the single entry with the highest numeric
///   priority value currently queued, with a ledger entry for the eviction.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::error::TransportError;
use crate::ledger::{LedgerHandle, OperationContext};

// ---------------------------------------------------------------------------
// Operation types
// ---------------------------------------------------------------------------

pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A deferred unit of work. Invoked once per drain pass until it succeeds,
/// exhausts its retries, or is evicted.
pub type QueuedAction = Box<dyn FnMut() -> ActionFuture + Send>;

/// Wrap an async closure into a [`QueuedAction`].
pub fn boxed_action<F, Fut>(mut f: F) -> QueuedAction
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

pub struct QueuedOperation {
    pub id: Uuid,
    action: QueuedAction,
    pub context: OperationContext,
    /// Lower value = more urgent.
    pub priority: u8,
    pub retry_count: u32,
    /// Insertion order tiebreak within a priority band.
    seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub total_succeeded: u64,
    pub total_dropped: u64,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct DrainCtl {
    in_progress: bool,
}

struct QueueInner {
    /// Sorted by (priority, seq): front = most urgent, back = least.
    pending: Mutex<Vec<QueuedOperation>>,
    seq: AtomicU64,
    config: ConfigHandle,
    ledger: LedgerHandle,
    ctl: Mutex<DrainCtl>,
    /// (completed pass count, last pass's success count). Late drain callers
    /// wait on this instead of starting a second pass.
    done: watch::Sender<(u64, usize)>,
    total_succeeded: AtomicU64,
    total_dropped: AtomicU64,
}

/// Cheap to clone; all clones share the same queue.
#[derive(Clone)]
pub struct ResilienceQueue {
    inner: Arc<QueueInner>,
}

impl ResilienceQueue {
    pub fn new(config: ConfigHandle, ledger: LedgerHandle) -> Self {
        let (done, _) = watch::channel((0u64, 0usize));
        ResilienceQueue {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                config,
                ledger,
                ctl: Mutex::new(DrainCtl { in_progress: false }),
                done,
                total_succeeded: AtomicU64::new(0),
                total_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.inner.ledger
    }

    // -----------------------------------------------------------------------
    // Queued path
    // -----------------------------------------------------------------------

    /// Queue a deferred operation. Returns its id.
    ///
    /// If the configured capacity would be exceeded, the single least-urgent
    /// entry currently queued is evicted first (and ledgered), then the new
    /// entry is inserted at its priority-sorted position.
    pub fn enqueue(&self, action: QueuedAction, context: OperationContext, priority: u8) -> Uuid {
        let capacity = self.inner.config.get().queue_capacity;
        let id = Uuid::new_v4();
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.inner.pending.lock().unwrap();
        if let Some(cap) = capacity {
            if cap > 0 && pending.len() >= cap {
                // Back of the sorted vec = highest numeric priority value.
                if let Some(evicted) = pending.pop() {
                    log::warn!(
                        "⚠️  queue at capacity {}, evicting '{}' (priority {})",
                        cap,
                        evicted.context.operation_name,
                        evicted.priority
                    );
                    self.inner.total_dropped.fetch_add(1, Ordering::Relaxed);
                    let ctx = evicted
                        .context
                        .with_meta("dropped_reason", "capacity_evicted");
                    self.inner.ledger.record(ctx);
                }
            }
        }

        let op = QueuedOperation {
            id,
            action,
            context,
            priority,
            retry_count: 0,
            seq,
        };
        let pos = pending.partition_point(|o| (o.priority, o.seq) <= (priority, seq));
        pending.insert(pos, op);
        log::debug!("queued operation {} at priority {}", id, priority);
        id
    }

    /// Process the whole queue once, most urgent first. Returns the number
    /// of operations that succeeded this pass.
    ///
    /// Overlapping calls coalesce: a caller that arrives while a pass is in
    /// progress waits for that pass and returns its result.
    pub async fn drain(&self) -> usize {
        let mut rx = self.inner.done.subscribe();
        let baseline = rx.borrow_and_update().0;

        {
            let mut ctl = self.inner.ctl.lock().unwrap();
            if ctl.in_progress {
                drop(ctl);
                // Join the in-progress pass.
                loop {
                    if rx.changed().await.is_err() {
                        return 0;
                    }
                    let (passes, succeeded) = *rx.borrow();
                    if passes > baseline {
                        return succeeded;
                    }
                }
            }
            ctl.in_progress = true;
        }

        let succeeded = self.run_pass().await;

        self.inner.ctl.lock().unwrap().in_progress = false;
        self.inner.done.send_modify(|(passes, last)| {
            *passes += 1;
            *last = succeeded;
        });
        succeeded
    }

    async fn run_pass(&self) -> usize {
        let max_retries = self.inner.config.get().max_retries;
        let batch: Vec<QueuedOperation> = {
            let mut pending = self.inner.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return 0;
        }
        log::debug!("draining {} queued operations", batch.len());

        let mut succeeded = 0;
        let mut requeue = Vec::new();
        for mut op in batch {
            op.context.attempt = op.retry_count + 1;
            match (op.action)().await {
                Ok(()) => {
                    succeeded += 1;
                    self.inner.total_succeeded.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "✓ queued operation '{}' succeeded on attempt {}",
                        op.context.operation_name,
                        op.context.attempt
                    );
                }
                Err(e) => {
                    op.retry_count += 1;
                    op.context.last_error = Some(e.to_string());
                    op.context.timestamp_ms = chrono::Utc::now().timestamp_millis();
                    self.inner.ledger.record(op.context.clone());

                    if op.retry_count >= max_retries {
                        // Exhausted: drop with a final ledger entry. Not an
                        // error value — the original caller already returned.
                        self.inner.total_dropped.fetch_add(1, Ordering::Relaxed);
                        let ctx = op
                            .context
                            .clone()
                            .with_meta("dropped_reason", "retries_exhausted");
                        self.inner.ledger.record(ctx);
                        log::error!(
                            "✗ dropping queued operation '{}' after {} failed attempts: {}",
                            op.context.operation_name,
                            op.retry_count,
                            e
                        );
                    } else {
                        log::warn!(
                            "queued operation '{}' failed (attempt {}), will retry next drain: {}",
                            op.context.operation_name,
                            op.retry_count,
                            e
                        );
                        requeue.push(op);
                    }
                }
            }
        }

        if !requeue.is_empty() {
            let mut pending = self.inner.pending.lock().unwrap();
            for mut op in requeue {
                op.seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                let pos =
                    pending.partition_point(|o| (o.priority, o.seq) <= (op.priority, op.seq));
                pending.insert(pos, op);
            }
        }
        succeeded
    }

    // -----------------------------------------------------------------------
    // Direct path
    // -----------------------------------------------------------------------

    /// Attempt `action` immediately, retrying with the configured backoff
    /// schedule. Every failed attempt is ledgered. Exhaustion surfaces
    /// [`TransportError::RetriesExhausted`] carrying the failure history.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        mut action: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let cfg = self.inner.config.get();
        let attempts = cfg.max_retries + 1;
        let mut history = Vec::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                let idx = (attempt - 2) as usize;
                let wait = cfg
                    .backoff_intervals_ms
                    .get(idx)
                    .or_else(|| cfg.backoff_intervals_ms.last())
                    .copied()
                    .unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(wait)).await;
            }

            match action().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!(
                            "✓ '{}' succeeded on attempt {}/{}",
                            operation_name,
                            attempt,
                            attempts
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let detail = e.to_string();
                    log::warn!(
                        "'{}' failed on attempt {}/{}: {}",
                        operation_name,
                        attempt,
                        attempts,
                        detail
                    );
                    let mut ctx = OperationContext::new(operation_name);
                    ctx.attempt = attempt;
                    ctx.last_error = Some(detail.clone());
                    self.inner.ledger.record(ctx);
                    history.push(detail);
                }
            }
        }

        let last_error = history.last().cloned().unwrap_or_default();
        Err(TransportError::RetriesExhausted {
            operation: operation_name.to_string(),
            attempts,
            last_error,
            history,
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Cap the queue. Writes through to the live configuration; existing
    /// entries are kept (the cap applies on the next enqueue).
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.inner.config.update(|c| c.queue_capacity = capacity);
    }

    /// Drop queued operations. With `keep_priority_below`, entries more
    /// urgent than the threshold survive; without it the queue empties.
    pub fn clear(&self, keep_priority_below: Option<u8>) {
        let mut pending = self.inner.pending.lock().unwrap();
        let before = pending.len();
        match keep_priority_below {
            Some(threshold) => pending.retain(|op| op.priority < threshold),
            None => pending.clear(),
        }
        log::debug!("cleared {} queued operations", before - pending.len());
    }

    pub fn len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.len(),
            total_succeeded: self.inner.total_succeeded.load(Ordering::Relaxed),
            total_dropped: self.inner.total_dropped.load(Ordering::Relaxed),
        }
    }
}
