//! The carrier: a plain TCP connection the tunnel's IP packets ride inside,
//! each one framed with a 2-byte big-endian length prefix.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};

use crate::cli::Role;
use crate::packet::MAX_FRAME;

/// Establish the carrier connection: accept one client as server, or connect
/// out as client. Either way, disable Nagle — these frames are latency
/// sensitive, not throughput-bound, and batching them would defeat the
/// scheduler's own pacing.
pub fn establish(role: &Role, port: u16) -> io::Result<TcpStream> {
    let stream = match role {
        Role::Server => {
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            let (stream, _peer) = listener.accept()?;
            stream
        }
        Role::Client(addr) => TcpStream::connect((addr.as_str(), port))?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Read one length-prefixed frame into `buf`, returning its length.
/// `Ok(None)` means the carrier was closed cleanly at a frame boundary;
/// anything else (a short read mid-frame) is an error, since that can only
/// mean the peer died mid-write.
pub fn read_framed(sock: &mut TcpStream, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut len_buf = [0u8; 2];
    if !read_exact_or_eof(sock, &mut len_buf)? {
        return Ok(None);
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "carrier frame exceeds MTU",
        ));
    }
    if len > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "carrier frame exceeds read buffer",
        ));
    }
    read_exact_or_eof(sock, &mut buf[..len])?;
    Ok(Some(len))
}

/// Write `data` as one length-prefixed frame.
pub fn write_framed(sock: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    let len: u16 = data
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large to frame"))?;
    sock.write_all(&len.to_be_bytes())?;
    sock.write_all(data)?;
    Ok(())
}

/// Like `Read::read_exact`, but an EOF before any byte was read reports
/// `Ok(false)` instead of an error — a clean boundary, not a failure. An EOF
/// after a partial read still surfaces as `UnexpectedEof`.
fn read_exact_or_eof(sock: &mut TcpStream, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        let n = sock.read(&mut buf[read..])?;
        if n == 0 {
            return if read == 0 {
                Ok(false)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "carrier closed mid-frame",
                ))
            };
        }
        read += n;
    }
    Ok(true)
}
