//! Ready set of the run loop.
//!
//! Components are armed with a deadline on the runtime clock and popped in
//! deadline order, ties broken by arming order. A component is armed at most
//! once; cancelled entries are skipped lazily when popped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use hashbrown::HashMap;

use crate::context::Urgency;
use crate::message::ComponentId;

#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<(u64, u64, ComponentId)>>,
    /// Live entries: component to the sequence number of its heap entry.
    armed: HashMap<ComponentId, u64>,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `id` relative to clock `now`. A component that is already armed
    /// keeps its earlier entry.
    pub fn arm(&mut self, id: ComponentId, urgency: Urgency, now: u64) -> bool {
        if self.armed.contains_key(&id) {
            return false;
        }
        let deadline = match urgency {
            Urgency::Now => now,
            Urgency::After(ticks) => now.saturating_add(ticks),
        };
        self.seq += 1;
        self.armed.insert(id, self.seq);
        self.heap.push(Reverse((deadline, self.seq, id)));
        true
    }

    pub fn cancel(&mut self, id: ComponentId) -> bool {
        self.armed.remove(&id).is_some()
    }

    pub fn is_armed(&self, id: ComponentId) -> bool {
        self.armed.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.skip_stale();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop the next component whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<ComponentId> {
        self.skip_stale();
        let Reverse((deadline, _, _)) = self.heap.peek()?;
        if *deadline > now {
            return None;
        }
        let Reverse((_, _, id)) = self.heap.pop()?;
        self.armed.remove(&id);
        Some(id)
    }

    fn skip_stale(&mut self) {
        while let Some(Reverse((_, seq, id))) = self.heap.peek() {
            if self.armed.get(id) == Some(seq) {
                break;
            }
            self.heap.pop();
        }
    }
}
