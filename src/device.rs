//! Tun/tap device allocation, and the `TapDevice` seam that lets the engine
//! run against a fake device in tests instead of a real `/dev/net/tun`.

use std::io;
use std::os::fd::AsRawFd;

use tun_tap::{Iface, Mode};

/// Which kind of virtual interface to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Layer 3: the device hands us raw IP packets, which is all this
    /// tunnel ever looks at.
    Tun,
    /// Layer 2, for setups that need an Ethernet-framed link instead.
    Tap,
}

/// Allocate `ifname` in the requested mode, without the `tun-tap` crate's
/// optional 4-byte packet-information prefix — every `Packet` this crate
/// handles starts directly at the IP header.
pub fn open(ifname: &str, mode: DeviceMode) -> io::Result<Iface> {
    let mode = match mode {
        DeviceMode::Tun => Mode::Tun,
        DeviceMode::Tap => Mode::Tap,
    };
    Iface::without_packet_info(ifname, mode)
}

/// Whatever the engine reads raw IP packets from and writes them back to.
/// Implemented by the real `tun_tap::Iface`, and by a fake in tests so the
/// engine's loop can run without `CAP_NET_ADMIN`.
pub trait TapDevice: AsRawFd {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

impl TapDevice for Iface {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        Iface::recv(self, buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        Iface::send(self, buf)
    }
}

/// Not part of the tunnel itself — kept here, undocumented, for the
/// scenario test under `tests/` that can't open a real `/dev/net/tun`.
#[doc(hidden)]
pub mod test_util {
    //! A `TapDevice` backed by a `SOCK_DGRAM` socketpair, preserving packet
    //! boundaries the way a real tun fd does. One end lives here; the other
    //! stays with the test harness to inject and capture packets directly.
    use super::*;
    use std::os::fd::{OwnedFd, RawFd};

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    pub struct FakeTap(OwnedFd);

    impl FakeTap {
        /// Returns `(engine_side, harness_side)`.
        pub fn pair() -> io::Result<(FakeTap, OwnedFd)> {
            let (a, b) = socketpair(
                AddressFamily::Unix,
                SockType::Datagram,
                None,
                SockFlag::empty(),
            )
            .map_err(io::Error::from)?;
            Ok((FakeTap(a), b))
        }
    }

    impl AsRawFd for FakeTap {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    impl TapDevice for FakeTap {
        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            nix::unistd::read(self.0.as_raw_fd(), buf).map_err(io::Error::from)
        }

        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            nix::unistd::write(&self.0, buf).map_err(io::Error::from)
        }
    }
}
