/*

vbus emulates a CAN bus on top of TCP. Every participant connects to a single router process,
announces its id, and from then on exchanges fixed-size packets with the router, which forwards
each packet to its destination or, for broadcasts, to every other participant.

# Packets

Every packet occupies exactly 36 bytes on the wire, big-endian:

  psn:u32 | tps:u32 | src:u32 | dst:u32 | dlc:u8 | flags:u8 | crc:u16 | timestamp:u64 | data[8]

PSN is the packet's index within its message and TPS is the total number of packets in that
message. Only the first DLC bytes of data are meaningful, and the CRC covers exactly those bytes:

  CRC-16, reflected polynomial 0xA001, initial value 0xFFFF, no final xor

A packet whose CRC does not match is dropped by whichever side reads it.

Flags:

  0x01  broadcast
  0x02  remote request
  0x04  passive / error
  0x08  init

# Connecting

The first packet on a new connection is the init packet: source id set, DLC 0, PSN 0, TPS 0,
init flag set. The router registers the connection under that id only if the id is nonzero and
not already registered; otherwise the connection is dropped. Once registered, a connection is
forwarded packets addressed to its id until it disconnects.

# Messages

A message of N bytes is split into ceil(N / 8) packets sharing one TPS, with PSNs 0..TPS. The
router forwards packets individually and never reassembles. Receivers collect packets per
(source, destination) pair and deliver the message once TPS distinct PSNs have arrived, in any
order. Only one message per pair may be in flight at a time.

Delivery is best effort. A sender wanting reliability pairs each packet with a retransmission
timer from the scheduler and resends on timeout; acknowledgments are an application concern.

# Clock

Processes may share a tick counter kept in a named shared-memory segment. The process that
creates the segment advances the counter; every process may wait for the next tick.

*/

pub mod client;
pub mod clock;
pub mod error;
pub mod frame;
pub mod manager;
pub mod message;
pub mod node;
pub mod scheduler;
pub mod server;
pub mod socket;

use std::time;

/// Identifies a bus participant. Id 0 is reserved.
pub type NodeId = u32;

/// Port the router listens on by default.
pub const ROUTER_PORT_DEFAULT: u16 = 8888;

/// Connection backlog of the router's listening socket.
pub const LISTEN_BACKLOG_DEFAULT: u32 = 16;

/// Duration of one clock and scheduler tick.
pub const CLOCK_TICK_DEFAULT: time::Duration = time::Duration::from_millis(100);

/// Ticks a retransmission timer waits for an ACK.
pub const ACK_TIMEOUT_TICKS_DEFAULT: u32 = 5;

/// Name of the shared clock segment.
pub const CLOCK_SEGMENT_NAME: &str = "/vbus_clock";

pub use error::{Error, Result};
pub use frame::{Flags, Packet};
pub use message::Message;

pub type Client = client::Client;
pub type Server = server::Server;
pub type Manager = manager::Manager;
pub type Node = node::Node;
pub type Scheduler = scheduler::Scheduler;
pub type GlobalClock = clock::GlobalClock;
