//! # Latches
//!
//! Serializes commands whose declared spans conflict. Requests are admitted in
//! arrival order: a request waits until no earlier-arrived request with a
//! conflicting [SpanSet] still holds or awaits its latches. Non-conflicting
//! requests proceed concurrently.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

use crate::spanset::SpanSet;

struct LatchState {
    next_seq: u64,
    /// Registered requests keyed by arrival.
    latches: BTreeMap<u64, Arc<SpanSet>>,
}

struct Inner {
    state: Mutex<LatchState>,
    /// Bumped whenever a latch is released.
    released_tx: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct LatchManager {
    inner: Arc<Inner>,
}

impl Default for LatchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LatchManager {
    pub fn new() -> Self {
        let (released_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LatchState {
                    next_seq: 0,
                    latches: BTreeMap::new(),
                }),
                released_tx,
            }),
        }
    }

    /// Waits until `spans` can be latched without conflict and returns a guard
    /// holding them. Dropping the returned future before it completes withdraws
    /// the request.
    pub async fn acquire(&self, spans: SpanSet) -> LatchGuard {
        let spans = Arc::new(spans);
        let guard = {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.latches.insert(seq, spans.clone());
            LatchGuard {
                manager: self.clone(),
                seq,
            }
        };

        loop {
            // Subscribe before checking so a release between the check and
            // the wait is not missed.
            let mut released_rx = self.inner.released_tx.subscribe();
            if !self.has_earlier_conflict(guard.seq, &spans) {
                return guard;
            }
            trace!(seq = guard.seq, "waiting on conflicting latches");
            if released_rx.changed().await.is_err() {
                return guard;
            }
        }
    }

    fn has_earlier_conflict(&self, seq: u64, spans: &SpanSet) -> bool {
        let state = self.inner.state.lock();
        state
            .latches
            .range(..seq)
            .any(|(_, earlier)| earlier.conflicts_with(spans))
    }

    fn release(&self, seq: u64) {
        self.inner.state.lock().latches.remove(&seq);
        self.inner.released_tx.send_modify(|released| *released += 1);
    }

    /// Number of requests holding or awaiting latches.
    pub fn len(&self) -> usize {
        self.inner.state.lock().latches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Latches held by one request. Released on drop.
pub struct LatchGuard {
    manager: LatchManager,
    seq: u64,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.manager.release(self.seq);
    }
}
