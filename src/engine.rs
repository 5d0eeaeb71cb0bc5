//! The main loop: wires the scheduler, the two packet queues, and the
//! congestion-signal state machine around the tun device and the carrier
//! socket.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use tun_tap::Iface;

use crate::carrier::{self, establish};
use crate::cli::Config;
use crate::congestion::{CongestionFsm, SpoofAction};
use crate::device::{self, TapDevice};
use crate::diag::Diag;
use crate::packet::{self, Packet, MAX_FRAME};
use crate::queue::PacketQueue;
use crate::scheduler::{ReadySet, Scheduler};

/// Packets each direction's queue can hold before it starts rejecting.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Minimum spacing between consecutive writes on either direction.
pub const DEFAULT_PACE: Duration = Duration::from_millis(50);
/// A queue arms the congestion signal once its occupancy passes
/// `capacity / HIGH_WATER_DIVISOR`.
const HIGH_WATER_DIVISOR: usize = 5;

/// Generic over `TapDevice` so tests can drive the loop with a fake tap
/// instead of a real `/dev/net/tun`; `main.rs` only ever instantiates it as
/// `Engine<tun_tap::Iface>`.
pub struct Engine<T: TapDevice> {
    tap: T,
    sock: std::net::TcpStream,
    qtap: PacketQueue,
    qsock: PacketQueue,
    scheduler: Scheduler,
    fsm: CongestionFsm,
    diag: Diag,
}

impl Engine<Iface> {
    /// Build an engine from a parsed CLI config: opens the tun/tap device
    /// and establishes the carrier connection.
    pub fn from_config(cfg: &Config, diag: Diag) -> io::Result<Self> {
        let tap = device::open(&cfg.ifname, cfg.mode)?;
        let sock = establish(&cfg.role, cfg.port)?;
        Ok(Self::new(tap, sock, diag))
    }
}

impl<T: TapDevice> Engine<T> {
    pub fn new(tap: T, sock: std::net::TcpStream, diag: Diag) -> Self {
        Self::with_tuning(tap, sock, diag, DEFAULT_QUEUE_CAPACITY, DEFAULT_PACE)
    }

    pub fn with_tuning(
        tap: T,
        sock: std::net::TcpStream,
        diag: Diag,
        queue_capacity: usize,
        pace: Duration,
    ) -> Self {
        let high_water = (queue_capacity / HIGH_WATER_DIVISOR).max(1);
        Engine {
            tap,
            sock,
            qtap: PacketQueue::new(queue_capacity, "qtap"),
            qsock: PacketQueue::new(queue_capacity, "qsock"),
            scheduler: Scheduler::new(pace),
            fsm: CongestionFsm::new(high_water),
            diag,
        }
    }

    /// Run forever. Only returns on an I/O error — a clean carrier close is
    /// reported as `UnexpectedEof`, since this tunnel has no notion of a
    /// graceful end-of-session.
    pub fn run(&mut self) -> io::Result<()> {
        let mut tap_buf = [0u8; MAX_FRAME];
        let mut sock_buf = [0u8; MAX_FRAME];
        loop {
            self.tick(&mut tap_buf, &mut sock_buf)?;
        }
    }

    /// Run exactly one wait/dispatch cycle. `run` is just this in a loop;
    /// exposed separately so scenario tests can single-step the engine
    /// against a fake tap and a loopback carrier.
    pub fn run_once(&mut self, tap_buf: &mut [u8], sock_buf: &mut [u8]) -> io::Result<()> {
        self.tick(tap_buf, sock_buf)
    }

    fn tick(&mut self, tap_buf: &mut [u8], sock_buf: &mut [u8]) -> io::Result<()> {
        // SAFETY: both fds outlive this call, borrowed only for its duration.
        let tap_fd = unsafe { BorrowedFd::borrow_raw(self.tap.as_raw_fd()) };
        let sock_fd = unsafe { BorrowedFd::borrow_raw(self.sock.as_raw_fd()) };
        let ready = self.scheduler.tick(tap_fd, sock_fd)?;

        if ready.contains(ReadySet::TAP_IN) {
            self.handle_tap_readable(tap_buf)?;
        }
        if ready.contains(ReadySet::SOCK_IN) {
            self.handle_sock_readable(sock_buf)?;
        }
        if ready.contains(ReadySet::SOCK_OUT_OK) {
            self.handle_sock_writable()?;
        }
        if ready.contains(ReadySet::TAP_OUT_OK) {
            self.handle_tap_writable()?;
        }
        if ready.intersects(ReadySet::TAP_OVERRUN | ReadySet::SOCK_OVERRUN) {
            self.diag.debug(format_args!(
                "scheduler: a write deadline fired with its peer not yet writable"
            ));
        }
        Ok(())
    }

    fn handle_tap_readable(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let n = self.tap.recv(buf)?;
        let packet = Packet::with_timestamp(buf[..n].to_vec());
        let seq = packet::tcp_seq(packet.as_bytes());

        let Some(packet) = self.fsm.on_tap_inbound(packet) else {
            self.diag
                .debug(format_args!("qtap: suppressed retransmission of the trigger segment"));
            return Ok(());
        };

        let len = packet.len();
        match self.qtap.enqueue(packet) {
            Ok(()) => {
                if let Some(seq) = seq {
                    self.fsm.note_tap_enqueued(self.qtap.fullness(), seq);
                }
            }
            Err(_dropped) => {
                self.diag.debug(format_args!(
                    "{}: full at {} packets, dropping {len}-byte packet",
                    self.qtap.name(),
                    self.qtap.fullness()
                ));
            }
        }
        Ok(())
    }

    fn handle_sock_readable(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match carrier::read_framed(&mut self.sock, buf)? {
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "carrier connection closed",
            )),
            Some(n) => {
                let packet = Packet::with_timestamp(buf[..n].to_vec());
                let len = packet.len();
                if self.qsock.enqueue(packet).is_err() {
                    self.diag.debug(format_args!(
                        "{}: full at {} packets, dropping {len}-byte packet",
                        self.qsock.name(),
                        self.qsock.fullness()
                    ));
                }
                Ok(())
            }
        }
    }

    fn handle_sock_writable(&mut self) -> io::Result<()> {
        match self.qtap.dequeue() {
            None => self.scheduler.release_tap_deadline(),
            Some(packet) => carrier::write_framed(&mut self.sock, packet.as_bytes())?,
        }
        Ok(())
    }

    fn handle_tap_writable(&mut self) -> io::Result<()> {
        let Some(packet) = self.qsock.dequeue() else {
            self.scheduler.release_sock_deadline();
            return Ok(());
        };
        match self.fsm.on_sock_writable(packet) {
            SpoofAction::Forward(p) => {
                self.tap.send(p.as_bytes())?;
            }
            SpoofAction::Burst(dupacks) => {
                self.diag
                    .debug(format_args!("qsock: spoofing {} dupack(s)", dupacks.len()));
                for p in &dupacks {
                    self.tap.send(p.as_bytes())?;
                }
            }
        }
        Ok(())
    }
}
