//! Per-message count of exhausted delivery cycles.
//!
//! Classic queues do not tell the consumer how often a message came back,
//! so the relay keeps its own tally keyed by `QueueMessage::ledger_key`.
//! The broker's `x-delivery-count`, when present, takes precedence if it is
//! higher (it survives restarts, the ledger does not).

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
};

use tracing::debug;

/// Default number of keys tracked before the oldest are evicted.
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

/// Bounded map from message key to exhausted-cycle count.
#[derive(Debug)]
pub struct RedeliveryLedger {
    capacity: usize,
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    counts: HashMap<String, u32>,
    insertion_order: VecDeque<String>,
}

impl RedeliveryLedger {
    /// Creates a ledger holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), state: Mutex::new(LedgerState::default()) }
    }

    /// Records one more exhausted cycle for `key` and returns the total.
    ///
    /// A first delivery (`redelivered == false`) starts the count over at 1:
    /// an earlier tally under the same key belongs to another message with
    /// the same body. `broker_count` is the number of earlier deliveries
    /// reported by the broker; the current cycle is one past it.
    pub fn record_exhaustion(
        &self,
        key: &str,
        redelivered: bool,
        broker_count: Option<u32>,
    ) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = match state.counts.get(key) {
            Some(&count) if redelivered => count,
            _ => 0,
        };
        let local = previous.saturating_add(1);
        let reported = broker_count.map_or(0, |count| count.saturating_add(1));
        let total = local.max(reported);

        if state.counts.insert(key.to_string(), total).is_none() {
            state.insertion_order.push_back(key.to_string());
            while state.insertion_order.len() > self.capacity {
                if let Some(evicted) = state.insertion_order.pop_front() {
                    state.counts.remove(&evicted);
                    debug!(key = %evicted, "redelivery ledger full, evicted oldest entry");
                }
            }
        }

        total
    }

    /// Current count for `key`, zero if untracked.
    pub fn count(&self, key: &str) -> u32 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.counts.get(key).copied().unwrap_or(0)
    }

    /// Forgets `key` once its message has left the queue.
    pub fn clear(&self, key: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.counts.remove(key).is_some() {
            state.insertion_order.retain(|k| k != key);
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).counts.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RedeliveryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}
