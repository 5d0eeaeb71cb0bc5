//! Bounded circular packet queue with an EWMA fullness estimate.
//!
//! `front == rear` means empty; the queue never fills every slot, leaving one
//! slot always unused so that "empty" and "full" stay distinguishable without
//! a separate count field for addressing. `fullness` (the exact occupancy)
//! is kept alongside for anything that needs an exact read.

use crate::packet::Packet;

const EWMA_ALPHA: f64 = 0.5;

/// A single-producer, single-consumer ring buffer of packets.
#[derive(Debug)]
pub struct PacketQueue {
    name: &'static str,
    capacity: usize,
    slots: Vec<Option<Packet>>,
    front: usize,
    rear: usize,
    fullness: usize,
    bfullness: usize,
    sfullness: f64,
}

impl PacketQueue {
    /// `capacity` is the number of packets this queue can ever hold
    /// simultaneously; internally one extra slot is reserved to keep the
    /// front/rear addressing unambiguous.
    pub fn new(capacity: usize, name: &'static str) -> Self {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        let mut slots = Vec::with_capacity(capacity + 1);
        slots.resize_with(capacity + 1, || None);
        PacketQueue {
            name,
            capacity: capacity + 1,
            slots,
            front: 0,
            rear: 0,
            fullness: 0,
            bfullness: 0,
            sfullness: 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of packets in the queue right now.
    pub fn fullness(&self) -> usize {
        self.fullness
    }

    /// Total bytes across all queued packets right now.
    pub fn bfullness(&self) -> usize {
        self.bfullness
    }

    /// Exponentially weighted moving average of `fullness`, updated on every
    /// enqueue and dequeue (alpha = 0.5: this sample and the running average
    /// weigh equally).
    pub fn sfullness(&self) -> f64 {
        self.sfullness
    }

    pub fn is_empty(&self) -> bool {
        self.front == self.rear
    }

    fn advance(&self, idx: usize) -> usize {
        (idx + 1) % self.capacity
    }

    fn update_ewma(&mut self) {
        self.sfullness = (1.0 - EWMA_ALPHA) * self.sfullness + EWMA_ALPHA * self.fullness as f64;
    }

    /// Enqueue `p`. Returns `p` back in `Err` if the queue is full, so a
    /// rejected packet is never silently dropped by this layer — the caller
    /// decides what "full" means (log it, drop it, count it).
    pub fn enqueue(&mut self, p: Packet) -> Result<(), Packet> {
        let next = self.advance(self.rear);
        if next == self.front {
            return Err(p);
        }
        self.bfullness += p.len();
        self.slots[next] = Some(p);
        self.rear = next;
        self.fullness += 1;
        self.update_ewma();
        Ok(())
    }

    /// Remove and return the oldest packet, or `None` if the queue is empty.
    pub fn dequeue(&mut self) -> Option<Packet> {
        if self.is_empty() {
            return None;
        }
        let next = self.advance(self.front);
        let p = self.slots[next].take();
        self.front = next;
        if let Some(ref packet) = p {
            self.bfullness -= packet.len();
            self.fullness -= 1;
        }
        self.update_ewma();
        p
    }

    /// Borrow the oldest packet without removing it. Reads exactly the slot
    /// `dequeue` would take next, so a `peek` immediately followed by a
    /// `dequeue` observes the same packet.
    pub fn peek(&self) -> Option<&Packet> {
        if self.is_empty() {
            return None;
        }
        let next = self.advance(self.front);
        self.slots[next].as_ref()
    }
}
