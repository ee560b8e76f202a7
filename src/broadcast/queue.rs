use std::sync::Mutex;
use tracing::trace;

use crate::membership::types::NodeId;

/// Number of times a broadcast is transmitted before it is dropped:
/// `ceil(mult * ln(n + 1))`, at least one.
pub fn retransmit_limit(mult: u32, cluster_size: usize) -> usize {
    let limit = (mult as f64) * ((cluster_size as f64) + 1.0).ln();
    (limit.ceil() as usize).max(1)
}

struct Entry {
    name: NodeId,
    payload: Vec<u8>,
    transmits: usize,
    /// Insertion order, used as the deterministic tie-break.
    id: u64,
}

/// Transmit-limited queue of pending gossip payloads.
pub struct BroadcastQueue {
    entries: Mutex<Vec<Entry>>,
    next_id: Mutex<u64>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Queues a payload about `name`, invalidating any pending entry for the
    /// same node: two live claims about one name can never coexist.
    pub fn queue(&self, name: NodeId, payload: Vec<u8>) {
        let mut entries = self.entries.lock().expect("broadcast lock poisoned");
        entries.retain(|entry| entry.name != name);

        let mut next_id = self.next_id.lock().expect("broadcast lock poisoned");
        let id = *next_id;
        *next_id += 1;
        trace!("Queued broadcast for {} ({} bytes)", name, payload.len());
        entries.push(Entry {
            name,
            payload,
            transmits: 0,
            id,
        });
    }

    /// Selects entries to transmit: fewest transmissions first, newest first
    /// on ties, greedily packed so that payloads plus `overhead` bytes each
    /// stay under `limit`. Selected entries have their transmit counter
    /// bumped and are dropped once it reaches `transmit_cap`.
    pub fn get_broadcasts(
        &self,
        overhead: usize,
        limit: usize,
        transmit_cap: usize,
    ) -> Vec<Vec<u8>> {
        let mut entries = self.entries.lock().expect("broadcast lock poisoned");
        if entries.is_empty() {
            return Vec::new();
        }

        entries.sort_by(|a, b| {
            a.transmits
                .cmp(&b.transmits)
                .then(b.id.cmp(&a.id))
        });

        let mut selected = Vec::new();
        let mut used = 0usize;
        for entry in entries.iter_mut() {
            let cost = entry.payload.len() + overhead;
            if used + cost > limit {
                continue;
            }
            used += cost;
            entry.transmits += 1;
            selected.push(entry.payload.clone());
        }

        entries.retain(|entry| entry.transmits < transmit_cap);
        selected
    }

    /// Drops any pending entry for `name` (e.g. the node was pruned).
    pub fn invalidate(&self, name: &NodeId) {
        let mut entries = self.entries.lock().expect("broadcast lock poisoned");
        entries.retain(|entry| &entry.name != name);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("broadcast lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BroadcastQueue {
    fn default() -> Self {
        Self::new()
    }
}
