use crate::cluster::messages::{encoded_len, Broadcast};

struct Queued {
    /// Insertion order, oldest first
    id: u64,
    broadcast: Broadcast,
    transmits: u32,
    size: usize,
}

/// Transmit-limited broadcast queue
///
/// Each broadcast is piggybacked until it has been sent
/// `retransmit_mult * ceil(log10(n + 1))` times, where `n` is the number of
/// known members. A new broadcast replaces queued ones it invalidates.
/// Past `max_depth` items the oldest are dropped, so a node with no peers to
/// drain the queue keeps a bounded backlog.
pub(crate) struct BroadcastQueue {
    items: Vec<Queued>,
    retransmit_mult: u32,
    max_depth: usize,
    next_id: u64,
}

impl BroadcastQueue {
    pub fn new(retransmit_mult: u32, max_depth: usize) -> Self {
        Self {
            items: Vec::new(),
            retransmit_mult: retransmit_mult.max(1),
            max_depth: max_depth.max(1),
            next_id: 0,
        }
    }

    /// Queue a broadcast. Returns how many old items were pruned.
    pub fn push(&mut self, broadcast: Broadcast) -> usize {
        self.items
            .retain(|queued| !broadcast.invalidates(&queued.broadcast));
        let size = encoded_len(&broadcast);
        self.items.push(Queued {
            id: self.next_id,
            broadcast,
            transmits: 0,
            size,
        });
        self.next_id += 1;
        self.prune()
    }

    fn prune(&mut self) -> usize {
        let excess = self.items.len().saturating_sub(self.max_depth);
        if excess == 0 {
            return 0;
        }
        self.items.sort_by_key(|queued| queued.id);
        self.items.drain(..excess);
        excess
    }

    /// Take broadcasts fitting in `budget` bytes, least transmitted first
    pub fn take(&mut self, budget: usize, members: usize) -> Vec<Broadcast> {
        let limit = self.transmit_limit(members);
        self.items.sort_by_key(|queued| queued.transmits);

        let mut used = 0;
        let mut taken = Vec::new();
        for queued in self.items.iter_mut() {
            if used + queued.size > budget && !taken.is_empty() {
                continue;
            }
            used += queued.size;
            queued.transmits += 1;
            taken.push(queued.broadcast.clone());
        }

        self.items.retain(|queued| queued.transmits < limit);
        taken
    }

    pub fn transmit_limit(&self, members: usize) -> u32 {
        let scale = ((members + 1) as f64).log10().ceil().max(1.0) as u32;
        self.retransmit_mult * scale
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
