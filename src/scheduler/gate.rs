//! Weighted admission gate in front of the dispatcher.
//!
//! The compute backend accepts a bounded number of concurrent batches. Each
//! assembler asks the gate for a slot before dispatching; when slots run out
//! the requests wait in one FIFO per priority class. A freed slot is handed
//! to the next waiter chosen by weighted round robin: with a `3:1` ratio and
//! both classes waiting, three premium batches go out for every free one.
//! A class that is waiting alone is served without spending credits, so the
//! ratio only shapes contended periods. A `0:0` ratio is treated as `1:1`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use super::task::Priority;
use crate::config::PriorityRatio;

struct GateState {
    available: usize,
    premium_waiters: VecDeque<oneshot::Sender<GatePermit>>,
    free_waiters: VecDeque<oneshot::Sender<GatePermit>>,
    premium_credit: u32,
    free_credit: u32,
}

impl GateState {
    fn waiters(&mut self, priority: Priority) -> &mut VecDeque<oneshot::Sender<GatePermit>> {
        match priority {
            Priority::Premium => &mut self.premium_waiters,
            Priority::Free => &mut self.free_waiters,
        }
    }

    /// Picks the class that receives the next freed slot.
    fn next_class(&mut self, ratio: PriorityRatio) -> Option<Priority> {
        match (self.premium_waiters.is_empty(), self.free_waiters.is_empty()) {
            (true, true) => None,
            (false, true) => Some(Priority::Premium),
            (true, false) => Some(Priority::Free),
            (false, false) => {
                if self.premium_credit == 0 && self.free_credit == 0 {
                    self.premium_credit = ratio.premium;
                    self.free_credit = ratio.free;
                }
                if self.premium_credit > 0 {
                    self.premium_credit -= 1;
                    Some(Priority::Premium)
                } else {
                    self.free_credit -= 1;
                    Some(Priority::Free)
                }
            }
        }
    }
}

/// Bounded, premium-weighted admission of batches to the dispatcher.
pub struct AdmissionGate {
    ratio: PriorityRatio,
    capacity: usize,
    state: Mutex<GateState>,
}

impl AdmissionGate {
    /// Creates a gate with `capacity` concurrent slots.
    pub fn new(capacity: usize, ratio: PriorityRatio) -> Arc<Self> {
        let capacity = capacity.max(1);
        let ratio = if ratio.premium == 0 && ratio.free == 0 {
            PriorityRatio { premium: 1, free: 1 }
        } else {
            ratio
        };
        Arc::new(Self {
            ratio,
            capacity,
            state: Mutex::new(GateState {
                available: capacity,
                premium_waiters: VecDeque::new(),
                free_waiters: VecDeque::new(),
                premium_credit: ratio.premium,
                free_credit: ratio.free,
            }),
        })
    }

    /// Waits for a dispatch slot for a batch of the given class.
    ///
    /// The slot is held until the returned permit is dropped. A freed slot
    /// travels to the waiter as a permit, so dropping the future at any point
    /// (before or after it was handed a slot) puts the slot back.
    pub async fn acquire(self: &Arc<Self>, priority: Priority) -> GatePermit {
        loop {
            let rx = {
                let mut state = self.state.lock().expect("gate lock poisoned");
                if state.available > 0 {
                    state.available -= 1;
                    return GatePermit::new(Arc::clone(self), priority);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters(priority).push_back(tx);
                rx
            };

            trace!(priority = %priority, "Waiting for dispatch slot");
            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    /// Hands the freed slot to the next waiter, or returns it to the pool.
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        while let Some(priority) = state.next_class(self.ratio) {
            if let Some(tx) = state.waiters(priority).pop_front() {
                match tx.send(GatePermit::new(Arc::clone(self), priority)) {
                    Ok(()) => return,
                    // Waiter is gone; disarm so the drop does not re-enter.
                    Err(mut unclaimed) => unclaimed.gate = None,
                }
            }
        }
        state.available += 1;
    }

    /// Number of batches of `priority` currently waiting for a slot.
    pub fn waiting(&self, priority: Priority) -> usize {
        let mut state = self.state.lock().expect("gate lock poisoned");
        state.waiters(priority).len()
    }

    /// Slots not held by any batch.
    pub fn available(&self) -> usize {
        self.state.lock().expect("gate lock poisoned").available
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A held dispatch slot. Dropping it releases the slot.
pub struct GatePermit {
    gate: Option<Arc<AdmissionGate>>,
    priority: Priority,
}

impl GatePermit {
    fn new(gate: Arc<AdmissionGate>, priority: Priority) -> Self {
        Self {
            gate: Some(gate),
            priority,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}
