use std::fmt;
use std::io;

use super::NodeId;

/// Negative errno value returned by a [`SocketApi`](crate::socket::SocketApi) call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Errno(pub i32);

impl Errno {
    /// Converts a failed call result (`-errno`) into an `Errno`.
    pub fn from_result(result: isize) -> Self {
        Self(-(result as i32))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

/// Every failure a bus component can report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create socket: {0}")]
    SocketCreateFailed(Errno),
    #[error("failed to set socket option: {0}")]
    SocketOptionFailed(Errno),
    #[error("failed to connect to router: {0}")]
    ConnectFailed(Errno),
    #[error("failed to bind listening socket: {0}")]
    BindFailed(Errno),
    #[error("failed to listen: {0}")]
    ListenFailed(Errno),
    #[error("failed to accept connection: {0}")]
    AcceptFailed(Errno),
    /// A write returned a negative result or wrote fewer bytes than a whole packet.
    #[error("send failed ({written} of {expected} bytes written)")]
    SendFailed { written: isize, expected: usize },
    #[error("receive failed: {0}")]
    RecvFailed(Errno),
    /// The peer closed the connection (zero-length read).
    #[error("connection closed by peer")]
    Disconnected,
    /// Unicast target has no live connection.
    #[error("no connected client with id {0}")]
    InvalidClientId(NodeId),
    #[error("crc mismatch (carried {carried:#06x}, computed {computed:#06x})")]
    CrcMismatch { carried: u16, computed: u16 },
    /// Payload needs more packets than a receiver will reassemble.
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },
    #[error("malformed packet: {0}")]
    InvalidPacket(&'static str),
    /// Missing dependency or out-of-range setting at construction.
    #[error("invalid configuration: {0}")]
    Configuration(&'static str),
    #[error("operation not permitted in state {0}")]
    InvalidState(&'static str),
    #[error("failed to spawn thread: {0}")]
    Spawn(io::Error),
    #[error("shared memory error: {0}")]
    Shm(#[from] io::Error),
    #[error("global clock is not running")]
    ClockStopped,
    #[error("global clock segment was never initialized")]
    ClockUnavailable,
}

pub type Result<T> = std::result::Result<T, Error>;
