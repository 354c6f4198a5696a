//! Socket capability used by the client and server.
//!
//! [`SocketApi`] mirrors the BSD socket calls one to one. Every call returns the raw result:
//! a non-negative value on success and `-errno` on failure. Implementations perform no protocol
//! logic and never panic, so concurrent receive loops can treat every outcome as a number.

pub mod mem;
pub mod os;

use std::net;

use super::error::{Errno, Error, Result};
use super::frame::{self, Packet};

pub use mem::MemNetwork;
pub use os::OsSockets;

/// Socket descriptor handed out by a [`SocketApi`].
pub type Fd = i32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SockOpt {
    ReuseAddr,
    ReusePort,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

pub trait SocketApi: Send + Sync {
    /// Creates an IPv4 stream socket.
    fn socket(&self) -> Fd;

    fn setsockopt(&self, fd: Fd, opt: SockOpt, value: bool) -> i32;

    fn bind(&self, fd: Fd, addr: &net::SocketAddrV4) -> i32;

    fn listen(&self, fd: Fd, backlog: i32) -> i32;

    /// Blocks until a connection arrives and returns its descriptor.
    fn accept(&self, fd: Fd) -> Fd;

    fn connect(&self, fd: Fd, addr: &net::SocketAddrV4) -> i32;

    /// Returns the number of bytes written.
    fn send(&self, fd: Fd, buf: &[u8]) -> isize;

    /// Blocks until data is available. Returns the number of bytes read, or 0 once the peer has
    /// closed the connection.
    fn recv(&self, fd: Fd, buf: &mut [u8]) -> isize;

    /// Unblocks any thread waiting in `recv` or `accept` on this descriptor.
    fn shutdown(&self, fd: Fd, how: Shutdown) -> i32;

    fn close(&self, fd: Fd) -> i32;
}

/// Writes one whole packet. A negative result or a short write is reported as
/// [`Error::SendFailed`]; nothing is retried.
pub fn send_packet(api: &dyn SocketApi, fd: Fd, packet: &Packet) -> Result<()> {
    let bytes = frame::serial::write_packet(packet);

    let written = api.send(fd, &bytes);

    if written != bytes.len() as isize {
        return Err(Error::SendFailed {
            written,
            expected: bytes.len(),
        });
    }

    log::trace!(
        "fd {} <- {}->{} psn {}/{}",
        fd,
        packet.src,
        packet.dst,
        packet.psn,
        packet.tps
    );

    Ok(())
}

/// Reads exactly one packet's worth of bytes. Returns `Ok(None)` if the peer disconnected.
pub fn recv_packet(api: &dyn SocketApi, fd: Fd) -> Result<Option<[u8; frame::PACKET_SIZE]>> {
    let mut buffer = [0u8; frame::PACKET_SIZE];
    let mut filled = 0;

    while filled < buffer.len() {
        let n = api.recv(fd, &mut buffer[filled..]);

        if n == 0 {
            return Ok(None);
        }
        if n < 0 {
            return Err(Error::RecvFailed(Errno::from_result(n)));
        }

        filled += n as usize;
    }

    Ok(Some(buffer))
}
