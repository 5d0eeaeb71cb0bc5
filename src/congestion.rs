//! Backward ACK-spoofing congestion-signal state machine.
//!
//! A tagged `enum` drives every transition through a `match` the compiler
//! checks for totality — there is no out-of-range state to guard against.

use crate::packet::{self, Packet};
use crate::seq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    /// Nothing is armed; traffic flows unmodified.
    Idle,
    /// A high-water mark fired; waiting for the next reverse-path write to
    /// start counting.
    Armed,
    /// Counting forward-path packets until a template ACK is captured.
    Counting,
    /// Waiting for the next pure ACK on the reverse path to use as the
    /// dupack template.
    CapturingAck,
    /// Emitting fabricated dupack bursts, round `round`.
    Spoofing { round: u32 },
}

/// What the caller should do with a reverse-path (sock → tap) packet after
/// `on_sock_writable` has had a look.
pub enum SpoofAction {
    /// Write this packet to tap unchanged.
    Forward(Packet),
    /// Write these fabricated dupacks to tap instead of the packet that
    /// triggered them.
    Burst(Vec<Packet>),
}

/// Owns the congestion-signal state plus everything it needs across calls:
/// the captured dupack template, the sequence number retransmissions are
/// suppressed against, and the round's forward-path packet count.
pub struct CongestionFsm {
    state: CongestionState,
    high_water: usize,
    trigger_seq: Option<u32>,
    dupack_template: Option<Packet>,
    pkt_count: u32,
}

impl CongestionFsm {
    /// `high_water` is the tap-side queue occupancy that arms the signal —
    /// the caller computes this once from the queue's capacity.
    pub fn new(high_water: usize) -> Self {
        CongestionFsm {
            state: CongestionState::Idle,
            high_water,
            trigger_seq: None,
            dupack_template: None,
            pkt_count: 0,
        }
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    /// Forward-path (tap → queue) hook, called before the packet would be
    /// enqueued. Suppresses retransmissions of the trigger segment and, while
    /// `Counting`, tallies how many packets passed through this round.
    /// Returns `None` if the packet was suppressed (should not be enqueued).
    pub fn on_tap_inbound(&mut self, p: Packet) -> Option<Packet> {
        if let Some(trigger) = self.trigger_seq {
            if packet::tcp_seq(p.as_bytes()) == Some(trigger) {
                return None;
            }
        }
        if matches!(self.state, CongestionState::Counting) {
            self.pkt_count += 1;
        }
        Some(p)
    }

    /// Call once, right after a forward-path packet has actually been
    /// enqueued, with the queue's resulting occupancy and that packet's
    /// sequence number. Arms the signal if occupancy just crossed the
    /// high-water mark while idle.
    pub fn note_tap_enqueued(&mut self, fullness: usize, seq: u32) {
        if matches!(self.state, CongestionState::Idle) && fullness > self.high_water {
            self.trigger_seq = Some(seq);
            self.state = CongestionState::Armed;
        }
    }

    /// Reverse-path (queue → tap) hook, called once per dequeued packet on
    /// that path. Drives every transition past `Armed`, captures the dupack
    /// template, and fabricates spoofed bursts while `Spoofing`.
    pub fn on_sock_writable(&mut self, p: Packet) -> SpoofAction {
        match self.state {
            CongestionState::Armed => self.state = CongestionState::Counting,
            CongestionState::Counting => self.state = CongestionState::CapturingAck,
            _ => {}
        }

        match self.state {
            CongestionState::Idle | CongestionState::Counting => SpoofAction::Forward(p),
            CongestionState::Armed => unreachable!("just transitioned away above"),
            CongestionState::CapturingAck => {
                if packet::is_pure_tcp_ack(p.as_bytes()) {
                    self.dupack_template = Some(p.clone());
                    self.state = CongestionState::Spoofing { round: 1 };
                }
                SpoofAction::Forward(p)
            }
            CongestionState::Spoofing { round } => self.spoof_round(round, p),
        }
    }

    fn spoof_round(&mut self, round: u32, p: Packet) -> SpoofAction {
        let reached_trigger = match (packet::ack_seq(p.as_bytes()), self.trigger_seq) {
            (Some(ack), Some(trigger)) => seq::seq_ge(ack, trigger),
            _ => false,
        };
        if reached_trigger {
            self.reset_to_idle();
            return SpoofAction::Forward(p);
        }

        let tsval = packet::timestamp_val(p.as_bytes()).unwrap_or(0);
        let mut burst = Vec::new();
        if let Some(template) = &self.dupack_template {
            let base = (self.pkt_count as u64) * (round as u64 - 1);
            for i in 0..self.pkt_count {
                let plus = base + i as u64 + 1;
                if let Some(dup) = packet::build_dupack(template.as_bytes(), plus as u32, tsval) {
                    burst.push(dup);
                }
            }
        }
        self.state = CongestionState::Spoofing { round: round + 1 };
        SpoofAction::Burst(burst)
    }

    fn reset_to_idle(&mut self) {
        self.state = CongestionState::Idle;
        self.trigger_seq = None;
        self.dupack_template = None;
        self.pkt_count = 0;
    }
}
