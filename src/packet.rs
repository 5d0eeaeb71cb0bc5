//! Packet view / rewrite primitives: IPv4 + TCP + TCP-timestamp option.
//!
//! Header parsing and checksum computation go through `etherparse`, the same
//! crate the teacher parses and rewrites every packet with. The one
//! exception is the TCP timestamp option: this tunnel only ever reads and
//! rewrites the fixed 12-byte `NOP, NOP, Timestamp` block it expects, so that
//! stays a narrow, hand-coded check rather than a general options scan.

use std::time::Instant;

use etherparse::{IpNumber, Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice, TcpOptionElement};

/// Largest frame this tunnel will ever carry (matches the CLI's implicit MTU).
pub const MAX_FRAME: usize = 1500;

const TCP_MIN_HEADER: usize = 20;
/// `pad1, pad2, kind(8), len(10), tsval(4), tsecr(4)` — the fixed 12-byte
/// timestamp-option block this tunnel knows how to read and rewrite.
const TS_OPTION_LEN: usize = 12;
const TTL: u8 = 64;

/// One owned IP datagram moving through a queue.
///
/// Length is just `data.len()` — a `Vec<u8>` already makes "one owner, length
/// implied by the buffer" the only way to hold a packet, so there is no
/// separate counter to keep in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    pub arrived_at: Option<Instant>,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Packet {
            data,
            arrived_at: None,
        }
    }

    pub fn with_timestamp(data: Vec<u8>) -> Self {
        Packet {
            data,
            arrived_at: Some(Instant::now()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Parse the IPv4 header at the front of `buf` and, if its protocol is TCP,
/// the TCP header immediately following it. `None` on anything truncated,
/// malformed, non-IPv4, or non-TCP.
fn parse_ipv4_tcp(buf: &[u8]) -> Option<(Ipv4HeaderSlice<'_>, TcpHeaderSlice<'_>)> {
    let ip = Ipv4HeaderSlice::from_slice(buf).ok()?;
    if ip.protocol() != IpNumber::TCP {
        return None;
    }
    let tcp = TcpHeaderSlice::from_slice(buf.get(ip.slice().len()..)?).ok()?;
    Some((ip, tcp))
}

/// True iff `buf` is a well-formed IPv4/TCP segment with `ACK` set, no other
/// control flags, and zero payload bytes. Malformed input, non-IPv4, and
/// non-TCP all fall through to `false` rather than panicking.
pub fn is_pure_tcp_ack(buf: &[u8]) -> bool {
    let Some((ip, tcp)) = parse_ipv4_tcp(buf) else {
        return false;
    };
    if !tcp.ack() || tcp.fin() || tcp.syn() || tcp.rst() || tcp.psh() || tcp.urg() {
        return false;
    }
    buf.len() == ip.slice().len() + tcp.slice().len()
}

/// The TCP sequence number, in host byte order. `None` on anything that
/// doesn't parse as IPv4/TCP.
pub fn tcp_seq(buf: &[u8]) -> Option<u32> {
    let (_, tcp) = parse_ipv4_tcp(buf)?;
    Some(tcp.sequence_number())
}

/// The TCP acknowledgement number, only when `ACK` is set. `None` when the
/// segment doesn't ack anything, or doesn't parse as IPv4/TCP.
pub fn ack_seq(buf: &[u8]) -> Option<u32> {
    let (_, tcp) = parse_ipv4_tcp(buf)?;
    tcp.ack().then(|| tcp.acknowledgment_number())
}

/// The sender timestamp (`tsval`) from a TCP timestamp option at the fixed
/// offset this tunnel expects: two NOP pads then the 10-byte Timestamp
/// option, as the *first* (and only) TCP option. `None` if the segment's
/// options aren't exactly that 12-byte block, or the option isn't kind 8
/// ("Timestamps") — a deliberately narrow contract, not a general
/// TCP-options scanner.
pub fn timestamp_val(buf: &[u8]) -> Option<u32> {
    let (_, tcp) = parse_ipv4_tcp(buf)?;
    let opts = tcp.options();
    if opts.len() != TS_OPTION_LEN || opts[2] != 8 || opts[3] != 10 {
        return None;
    }
    Some(u32::from_be_bytes(opts[4..8].try_into().unwrap()))
}

/// Clone `template` (which must be a pure ACK with the fixed 12-byte TS
/// option) into a fresh dupack with the IP `identification` bumped by `plus`
/// (mod 2^16) and `tsval` replaced, recomputing both the IP and TCP
/// checksums via `etherparse`. `None` if `template` isn't a conforming pure
/// ACK — callers never fabricate a dupack from a template they can't
/// actually rewrite.
pub fn build_dupack(template: &[u8], plus: u32, tsval: u32) -> Option<Packet> {
    if !is_pure_tcp_ack(template) {
        return None;
    }
    let (ip, tcp) = parse_ipv4_tcp(template)?;
    if tcp.slice().len() != TCP_MIN_HEADER + TS_OPTION_LEN {
        return None;
    }
    let tsecr = u32::from_be_bytes(tcp.options()[8..12].try_into().unwrap());

    let mut ip_header = ip.to_header();
    ip_header.identification = ip_header.identification.wrapping_add(plus as u16);

    let mut tcp_header = tcp.to_header();
    tcp_header.set_options(&[TcpOptionElement::Timestamp(tsval, tsecr)]).ok()?;
    tcp_header.checksum = tcp_header.calc_checksum_ipv4(&ip_header, &[]).ok()?;

    let mut out = Vec::with_capacity(ip_header.header_len() as usize + tcp_header.header_len() as usize);
    ip_header.write(&mut out).ok()?;
    tcp_header.write(&mut out).ok()?;

    Some(Packet::new(out))
}
