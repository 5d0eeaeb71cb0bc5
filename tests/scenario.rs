//! End-to-end scenario tests driving the engine against a fake tap (an
//! in-process `SOCK_DGRAM` socketpair standing in for `/dev/net/tun`, which
//! needs `CAP_NET_ADMIN` this sandbox doesn't have) and a loopback TCP
//! carrier.
//!
//! Each engine runs on its own background thread for the lifetime of the
//! test: `poll` only returns when something real is ready, so driving it
//! tick-by-tick from the test body risks either starving it (too few ticks)
//! or deadlocking on a timeout-less wait (too many, with nothing left to do).
//! A free-running thread sidesteps both — the test threads are never
//! joined, they just idle forever in `poll` once the scenario is over.

use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::thread;
use std::time::Duration;

use etherparse::{IpNumber, Ipv4Header, TcpHeader, TcpOptionElement};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use dupacktun::carrier;
use dupacktun::device::test_util::FakeTap;
use dupacktun::diag::Diag;
use dupacktun::engine::Engine;
use dupacktun::packet;

const MAX_FRAME: usize = 1500;
const PACE: Duration = Duration::from_millis(1);
/// Generous but finite — a free-running engine thread that's gone wrong
/// (e.g. spinning on errors) still terminates instead of running forever.
const MAX_TICKS: usize = 20_000;

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (server, _) = listener.accept().unwrap();
    (server, client.join().unwrap())
}

fn spawn_engine<T>(mut engine: Engine<T>)
where
    T: dupacktun::device::TapDevice + Send + 'static,
{
    thread::spawn(move || {
        let mut tap_buf = [0u8; MAX_FRAME];
        let mut sock_buf = [0u8; MAX_FRAME];
        for _ in 0..MAX_TICKS {
            if engine.run_once(&mut tap_buf, &mut sock_buf).is_err() {
                break;
            }
        }
    });
}

const PEER: ([u8; 4], [u8; 4]) = ([10, 0, 0, 1], [10, 0, 0, 2]);
const TTL: u8 = 64;

/// Build an IPv4/TCP segment carrying `payload`, PSH+ACK set, no options —
/// through `etherparse`, the same way the teacher builds its own segments.
fn data_segment(seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    let mut tcp = TcpHeader::new(1234, 5678, seq, 4096);
    tcp.ack = true;
    tcp.psh = true;
    tcp.acknowledgment_number = ack;

    let payload_len = tcp.header_len() + payload.len() as u16;
    let mut ip = Ipv4Header::new(payload_len, TTL, IpNumber::TCP, PEER.0, PEER.1).unwrap();
    ip.identification = 1;

    tcp.checksum = tcp.calc_checksum_ipv4(&ip, payload).unwrap();

    let mut buf = Vec::with_capacity(ip.header_len() as usize + tcp.header_len() as usize + payload.len());
    ip.write(&mut buf).unwrap();
    tcp.write(&mut buf).unwrap();
    buf.extend_from_slice(payload);
    buf
}

/// Build a pure-ACK IPv4/TCP segment with the 12-byte TS option this tunnel
/// rewrites (`id`/`tsval` are the caller's choice).
fn pure_ack(ack: u32, id: u16, tsval: u32) -> Vec<u8> {
    let mut tcp = TcpHeader::new(1234, 5678, 1, 4096);
    tcp.ack = true;
    tcp.acknowledgment_number = ack;
    tcp.set_options(&[TcpOptionElement::Timestamp(tsval, 0)]).unwrap();

    let mut ip = Ipv4Header::new(tcp.header_len(), TTL, IpNumber::TCP, PEER.0, PEER.1).unwrap();
    ip.identification = id;

    tcp.checksum = tcp.calc_checksum_ipv4(&ip, &[]).unwrap();

    let mut buf = Vec::with_capacity(ip.header_len() as usize + tcp.header_len() as usize);
    ip.write(&mut buf).unwrap();
    tcp.write(&mut buf).unwrap();
    buf
}

fn write_tap(harness: &OwnedFd, buf: &[u8]) {
    nix::unistd::write(harness, buf).unwrap();
}

/// Poll `harness` for up to `timeout_ms`; `None` if nothing arrived in time.
fn try_read_tap(harness: &OwnedFd, timeout_ms: u16) -> Option<Vec<u8>> {
    let fd = unsafe { BorrowedFd::borrow_raw(harness.as_raw_fd()) };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    poll(&mut fds, PollTimeout::from(timeout_ms)).unwrap();
    if !fds[0]
        .revents()
        .map(|r| r.contains(PollFlags::POLLIN))
        .unwrap_or(false)
    {
        return None;
    }
    let mut buf = vec![0u8; MAX_FRAME];
    let n = nix::unistd::read(harness.as_raw_fd() as RawFd, &mut buf).unwrap();
    buf.truncate(n);
    Some(buf)
}

/// A single segment injected on A's tap reaches B's tap unchanged.
#[test]
fn s1_plain_forwarding() {
    let (a_tap_engine, a_tap_harness) = FakeTap::pair().unwrap();
    let (b_tap_engine, b_tap_harness) = FakeTap::pair().unwrap();
    let (a_sock, b_sock) = loopback_pair();

    spawn_engine(Engine::with_tuning(a_tap_engine, a_sock, Diag::new(false), 100, PACE));
    spawn_engine(Engine::with_tuning(b_tap_engine, b_sock, Diag::new(false), 100, PACE));

    let segment = data_segment(1000, 1, &[0xab; 100]);
    write_tap(&a_tap_harness, &segment);

    let received = try_read_tap(&b_tap_harness, 2000).expect("B's tap should emit the segment");
    assert_eq!(received, segment);
}

/// Crossing the high-water mark arms the signal, and once a reverse
/// ack reaches the trigger sequence, spoofing starts and then stops, with
/// every fabricated ack's fields rewritten correctly. Driven against a
/// single engine plus a bare peer socket playing "the far side of the
/// carrier" — nothing about this scenario needs a second full engine.
#[test]
fn s4_spoof_trigger() {
    let (a_tap_engine, a_tap_harness) = FakeTap::pair().unwrap();
    let (a_sock, mut peer_sock) = loopback_pair();

    let capacity = 100; // high_water = capacity / 5 = 20
    spawn_engine(Engine::with_tuning(a_tap_engine, a_sock, Diag::new(false), capacity, PACE));

    let base_seq = 1000u32;
    let trigger_seq = base_seq + 20 * 100; // the 21st segment (index 20) crosses 20.

    // Flood 25 data segments so Qtap.fullness crosses the high-water mark.
    for i in 0..25u32 {
        write_tap(&a_tap_harness, &data_segment(base_seq + i * 100, 1, &[0xcd; 40]));
    }

    // rp1: ARMED -> COUNTING (forwarded unmodified). TCP preserves frame
    // order over the carrier, so rp1/rp2/rp3/final can be written back to
    // back without waiting on each other — the engine's qsock FIFO is what
    // serializes them through the FSM in order.
    carrier::write_framed(&mut peer_sock, &pure_ack(trigger_seq - 100, 1, 111)).unwrap();
    let rp1 = try_read_tap(&a_tap_harness, 2000).expect("rp1 should forward unmodified");
    assert!(packet::is_pure_tcp_ack(&rp1));

    // Now that COUNTING is underway, two more forward-path packets tick
    // pkt_count up — so the eventual spoofed burst has more than one dupack.
    // (No synchronization needed here either: these land in Qtap and are
    // only consulted by the FSM once rp2 actually flips it to CAPTURING_ACK.)
    write_tap(&a_tap_harness, &data_segment(base_seq + 2500, 1, &[0xcd; 10]));
    write_tap(&a_tap_harness, &data_segment(base_seq + 2600, 1, &[0xcd; 10]));

    // rp2: COUNTING -> CAPTURING_ACK, captures this ack as the template, then
    // immediately enters SPOOFING (forwarded unmodified).
    carrier::write_framed(&mut peer_sock, &pure_ack(trigger_seq - 100, 2, 222)).unwrap();
    let rp2 = try_read_tap(&a_tap_harness, 2000).expect("rp2 (the template) should forward unmodified");
    assert!(packet::is_pure_tcp_ack(&rp2));

    // rp3: still below the trigger — this is where the fabricated burst comes out.
    carrier::write_framed(&mut peer_sock, &pure_ack(trigger_seq - 100, 3, 333)).unwrap();
    let burst_1 = try_read_tap(&a_tap_harness, 2000).expect("first spoofed dupack");
    assert!(packet::is_pure_tcp_ack(&burst_1));
    assert_eq!(packet::ack_seq(&burst_1), Some(trigger_seq - 100));
    assert_eq!(packet::timestamp_val(&burst_1), Some(333));

    if let Some(burst_2) = try_read_tap(&a_tap_harness, 200) {
        assert!(packet::is_pure_tcp_ack(&burst_2));
        assert_ne!(
            burst_1[4..6],
            burst_2[4..6],
            "successive dupacks must carry distinct IP ids"
        );
    }

    // The terminating ack: ack_seq has finally reached the trigger sequence,
    // so this one passes through unmodified and spoofing stops.
    carrier::write_framed(&mut peer_sock, &pure_ack(trigger_seq, 9, 999)).unwrap();
    let final_ack = try_read_tap(&a_tap_harness, 2000).expect("terminating ack should forward unmodified");
    assert_eq!(packet::ack_seq(&final_ack), Some(trigger_seq));
    assert_eq!(packet::timestamp_val(&final_ack), Some(999));
}
