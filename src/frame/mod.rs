pub mod serial;

use std::time;

use super::NodeId;

/// Maximum number of payload bytes carried by a single packet.
pub const PAYLOAD_SIZE_MAX: usize = 8;

/// Size of the fixed packet header on the wire.
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 1 + 1 + 2 + 8;

/// Every packet occupies exactly this many bytes on the wire.
pub const PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE_MAX;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flags(u8);

impl Flags {
    pub const BROADCAST: Flags = Flags(0x01);
    pub const REMOTE_REQUEST: Flags = Flags(0x02);
    /// Passive / error frame.
    pub const PASSIVE: Flags = Flags(0x04);
    /// Set only on the packet a process sends to announce itself to the router.
    pub const INIT: Flags = Flags(0x08);

    const ALL: u8 = 0x0F;

    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Unknown bits are discarded.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Flags(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Fixed-size bus packet. Only the first `dlc` bytes of `data` are meaningful.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    /// Sequence number of this packet within its message.
    pub psn: u32,
    /// Total number of packets in the message.
    pub tps: u32,
    pub src: NodeId,
    pub dst: NodeId,
    /// Data length code, 0..=8.
    pub dlc: u8,
    pub crc: u16,
    /// Milliseconds since the UNIX epoch at the time the packet was built.
    pub timestamp: u64,
    pub flags: Flags,
    pub data: [u8; PAYLOAD_SIZE_MAX],
}

fn timestamp_now_ms() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Packet {
    /// Builds a data packet. `payload` beyond 8 bytes is ignored (DLC is clamped), and the CRC is
    /// computed over the retained bytes.
    pub fn new(src: NodeId, dst: NodeId, psn: u32, tps: u32, payload: &[u8], flags: Flags) -> Self {
        let dlc = payload.len().min(PAYLOAD_SIZE_MAX);

        let mut data = [0u8; PAYLOAD_SIZE_MAX];
        data[..dlc].copy_from_slice(&payload[..dlc]);

        let mut packet = Self {
            psn,
            tps,
            src,
            dst,
            dlc: dlc as u8,
            crc: 0,
            timestamp: timestamp_now_ms(),
            flags,
            data,
        };

        packet.crc = packet.compute_crc();
        packet
    }

    /// Builds the packet a process sends first, carrying nothing but its id.
    pub fn init(src: NodeId) -> Self {
        Self::new(src, 0, 0, 0, &[], Flags::INIT)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.dlc as usize).min(PAYLOAD_SIZE_MAX)]
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags.contains(Flags::BROADCAST)
    }

    pub fn is_init(&self) -> bool {
        self.flags.contains(Flags::INIT)
    }

    pub fn compute_crc(&self) -> u16 {
        serial::crc16(self.payload())
    }

    /// Returns true if the carried CRC matches the current payload.
    pub fn verify_crc(&self) -> bool {
        self.compute_crc() == self.crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlc_clamped() {
        let packet = Packet::new(1, 2, 0, 1, &[7; 12], Flags::empty());

        assert_eq!(packet.dlc, 8);
        assert_eq!(packet.payload(), &[7; 8]);
        assert!(packet.verify_crc());
    }

    #[test]
    fn init_packet() {
        let packet = Packet::init(42);

        assert!(packet.is_init());
        assert!(!packet.is_broadcast());
        assert_eq!(packet.src, 42);
        assert_eq!(packet.dlc, 0);
        assert_eq!(packet.crc, 0xFFFF);
    }

    #[test]
    fn flags() {
        let mut flags = Flags::BROADCAST;
        flags.insert(Flags::PASSIVE);

        assert!(flags.contains(Flags::BROADCAST));
        assert!(flags.contains(Flags::PASSIVE));
        assert!(!flags.contains(Flags::INIT));
        assert_eq!(Flags::from_bits_truncate(0xFF).bits(), 0x0F);
    }
}
