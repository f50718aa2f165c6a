//! Per-trace analysis cache
//!
//! A closed trace never changes, so its analysis is built once and shared.
//! Concurrent requests for the same trace id wait on one fetch; a failed
//! fetch is not cached and the next request tries again.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use turnscope_trace::TraceAnalysis;

type Slot = Arc<OnceCell<Arc<TraceAnalysis>>>;

#[derive(Default)]
struct Slots {
    by_id: HashMap<String, Slot>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

/// Bounded trace id to analysis map
pub struct TraceCache {
    capacity: usize,
    slots: Mutex<Slots>,
}

impl TraceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Cached analysis, if a fetch for this id already succeeded
    pub fn get(&self, trace_id: &str) -> Option<Arc<TraceAnalysis>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.by_id.get(trace_id).and_then(|slot| slot.get().cloned())
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.by_id.values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached analysis or run `fetch` once for all concurrent
    /// callers of the same id.
    pub async fn get_or_fetch<F, Fut>(&self, trace_id: &str, fetch: F) -> Option<Arc<TraceAnalysis>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<TraceAnalysis>>,
    {
        let slot = self.slot(trace_id);
        slot.get_or_try_init(|| async { fetch().await.map(Arc::new).ok_or(()) })
            .await
            .ok()
            .cloned()
    }

    fn slot(&self, trace_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.by_id.get(trace_id) {
            return Arc::clone(slot);
        }
        while slots.order.len() >= self.capacity {
            match slots.order.pop_front() {
                Some(oldest) => {
                    slots.by_id.remove(&oldest);
                }
                None => break,
            }
        }
        let slot: Slot = Arc::new(OnceCell::new());
        slots.by_id.insert(trace_id.to_string(), Arc::clone(&slot));
        slots.order.push_back(trace_id.to_string());
        slot
    }
}

impl Default for TraceCache {
    fn default() -> Self {
        Self::new(1024)
    }
}
