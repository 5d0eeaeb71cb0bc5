//! Paced I/O scheduler: one `poll(2)` wait per tick, readiness for both
//! directions plus a per-direction write deadline that self-arms on arrival
//! and self-disarms once its queue runs dry.
//!
//! There is no `use_null_timeout`-style sentinel here: the "no deadline
//! armed" case is `Option::None`, and every other case goes through an
//! exhaustive `match`, so there is no integer encoding that can be left
//! unhandled.

use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

bitflags! {
    /// What a single scheduler tick found ready. More than one bit can be
    /// set at once (e.g. a packet arrived on tap in the same tick a stalled
    /// write finally went through).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadySet: u8 {
        /// The tap device has a packet to read.
        const TAP_IN       = 0b0000_0001;
        /// The carrier socket has a frame to read.
        const SOCK_IN      = 0b0000_0010;
        /// The forward-path deadline fired and the carrier socket is
        /// writable: dequeue from the tap-side queue and write it out.
        const SOCK_OUT_OK  = 0b0000_0100;
        /// The reverse-path deadline fired and the tap device is writable:
        /// dequeue from the socket-side queue and write it out.
        const TAP_OUT_OK   = 0b0000_1000;
        /// The forward-path deadline fired but the carrier socket was not
        /// writable; the deadline stays armed for the next tick.
        const SOCK_OVERRUN = 0b0001_0000;
        /// The reverse-path deadline fired but the tap device was not
        /// writable; the deadline stays armed for the next tick.
        const TAP_OVERRUN  = 0b0010_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacingSide {
    /// `tap_next_out` fired: tap → sock is due.
    ToSock,
    /// `sock_next_out` fired: sock → tap is due.
    ToTap,
}

/// Drives one `poll` wait per `tick`, arming/disarming the two write
/// deadlines around it.
pub struct Scheduler {
    pace: Duration,
    tap_next_out: Option<Instant>,
    sock_next_out: Option<Instant>,
}

impl Scheduler {
    pub fn new(pace: Duration) -> Self {
        Scheduler {
            pace,
            tap_next_out: None,
            sock_next_out: None,
        }
    }

    /// Disarm the forward-path (tap → sock) deadline; call when its queue ran dry.
    pub fn release_tap_deadline(&mut self) {
        self.tap_next_out = None;
    }

    /// Disarm the reverse-path (sock → tap) deadline; call when its queue ran dry.
    pub fn release_sock_deadline(&mut self) {
        self.sock_next_out = None;
    }

    /// Run one wait/dispatch cycle and report what's ready.
    ///
    /// Readability is always reported straight from `poll`. Write readiness
    /// is only probed when `poll` woke purely on a timeout (no fd was
    /// readable) — a write opportunity is only taken on the tick whose
    /// deadline actually expired, not opportunistically alongside unrelated
    /// read traffic.
    pub fn tick(&mut self, tap: BorrowedFd<'_>, sock: BorrowedFd<'_>) -> nix::Result<ReadySet> {
        let now = Instant::now();
        let remain_tap = self.tap_next_out.map(|d| d.saturating_duration_since(now));
        let remain_sock = self.sock_next_out.map(|d| d.saturating_duration_since(now));

        let (timeout, which) = match (remain_tap, remain_sock) {
            (None, None) => (PollTimeout::NONE, None),
            (Some(rt), None) => (to_poll_timeout(rt), Some(PacingSide::ToSock)),
            (None, Some(rs)) => (to_poll_timeout(rs), Some(PacingSide::ToTap)),
            (Some(rt), Some(rs)) if rt <= rs => (to_poll_timeout(rt), Some(PacingSide::ToSock)),
            (Some(_), Some(rs)) => (to_poll_timeout(rs), Some(PacingSide::ToTap)),
        };

        let mut fds = [
            PollFd::new(tap, PollFlags::POLLIN),
            PollFd::new(sock, PollFlags::POLLIN),
        ];
        let nready = poll(&mut fds, timeout)?;

        let mut ready = ReadySet::empty();
        let tap_readable = revents_has(&fds[0], PollFlags::POLLIN);
        let sock_readable = revents_has(&fds[1], PollFlags::POLLIN);

        if tap_readable {
            ready |= ReadySet::TAP_IN;
            self.tap_next_out.get_or_insert(now + self.pace);
        }
        if sock_readable {
            ready |= ReadySet::SOCK_IN;
            self.sock_next_out.get_or_insert(now + self.pace);
        }

        if nready == 0 {
            if let Some(side) = which {
                let mut wfds = [
                    PollFd::new(tap, PollFlags::POLLOUT),
                    PollFd::new(sock, PollFlags::POLLOUT),
                ];
                poll(&mut wfds, PollTimeout::from(0u16))?;
                let tap_writable = revents_has(&wfds[0], PollFlags::POLLOUT);
                let sock_writable = revents_has(&wfds[1], PollFlags::POLLOUT);

                match side {
                    PacingSide::ToSock => {
                        if sock_writable {
                            ready |= ReadySet::SOCK_OUT_OK;
                            self.tap_next_out = Some(now + self.pace);
                        } else {
                            ready |= ReadySet::SOCK_OVERRUN;
                        }
                    }
                    PacingSide::ToTap => {
                        if tap_writable {
                            ready |= ReadySet::TAP_OUT_OK;
                            self.sock_next_out = Some(now + self.pace);
                        } else {
                            ready |= ReadySet::TAP_OVERRUN;
                        }
                    }
                }
            }
        }

        Ok(ready)
    }
}

fn revents_has(fd: &PollFd<'_>, flag: PollFlags) -> bool {
    fd.revents().map(|r| r.contains(flag)).unwrap_or(false)
}

fn to_poll_timeout(d: Duration) -> PollTimeout {
    let millis = d.as_millis().min(u16::MAX as u128) as u16;
    PollTimeout::from(millis)
}
