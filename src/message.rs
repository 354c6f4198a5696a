//! Message fragmentation and reassembly.
//!
//! A message is split into `ceil(len / 8)` packets which share a TPS and carry PSNs
//! `0..tps`. The receiver collects packets per ordered (source, destination) pair and completes
//! a message once it holds `tps` distinct PSNs, regardless of arrival order.
//!
//! Only one message per ordered pair can be in flight: the pair is the whole reassembly key, so
//! two interleaved messages from the same sender to the same receiver are merged into one.

use std::collections::HashMap;

use super::error::Error;
use super::frame::{self, Flags, Packet};
use super::NodeId;

/// Largest TPS accepted by the receiver.
pub const MESSAGE_PACKETS_MAX: u32 = 65_536;

/// Largest payload that fragments into at most [`MESSAGE_PACKETS_MAX`] packets (512 KiB).
pub const MESSAGE_BYTES_MAX: usize = MESSAGE_PACKETS_MAX as usize * frame::PAYLOAD_SIZE_MAX;

/// A fully reassembled message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub src: NodeId,
    pub dst: NodeId,
    pub broadcast: bool,
    pub data: Box<[u8]>,
}

/// Splits `payload` into packets of at most 8 bytes each. An empty payload yields no packets.
///
/// Payloads over [`MESSAGE_BYTES_MAX`] produce a TPS the receiver rejects; callers check the
/// length first.
pub fn fragment(src: NodeId, dst: NodeId, payload: &[u8], broadcast: bool) -> Vec<Packet> {
    let flags = if broadcast {
        Flags::BROADCAST
    } else {
        Flags::empty()
    };

    let tps = payload.len().div_ceil(frame::PAYLOAD_SIZE_MAX) as u32;

    payload
        .chunks(frame::PAYLOAD_SIZE_MAX)
        .enumerate()
        .map(|(psn, chunk)| Packet::new(src, dst, psn as u32, tps, chunk, flags))
        .collect()
}

struct PendingMessage {
    tps: u32,
    chunks: Vec<Option<Box<[u8]>>>,
    received: u32,
    broadcast: bool,
}

impl PendingMessage {
    fn new(tps: u32, broadcast: bool) -> Self {
        Self {
            tps,
            chunks: vec![None; tps as usize],
            received: 0,
            broadcast,
        }
    }

    fn insert(&mut self, psn: u32, payload: &[u8]) {
        let slot = &mut self.chunks[psn as usize];

        if slot.is_none() {
            *slot = Some(payload.into());
            self.received += 1;
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.tps
    }

    fn assemble(self) -> Box<[u8]> {
        self.chunks
            .into_iter()
            .flatten()
            .flat_map(|chunk| chunk.into_vec())
            .collect::<Vec<_>>()
            .into_boxed_slice()
    }
}

/// Receiver-side reassembly state, keyed by (source, destination).
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<(NodeId, NodeId), PendingMessage>,
}

impl Reassembler {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a packet to its pending message. Returns the message once all of its packets have
    /// arrived; no state for that pair is retained afterward.
    ///
    /// Packets with a bad CRC or an impossible PSN/TPS are dropped.
    pub fn insert(&mut self, packet: &Packet) -> Option<Message> {
        let computed = packet.compute_crc();

        if computed != packet.crc {
            let err = Error::CrcMismatch {
                carried: packet.crc,
                computed,
            };
            log::debug!("dropping packet {}->{}: {}", packet.src, packet.dst, err);
            return None;
        }

        if packet.tps == 0 || packet.tps > MESSAGE_PACKETS_MAX || packet.psn >= packet.tps {
            log::warn!(
                "dropping packet {}->{} with psn {} / tps {}",
                packet.src,
                packet.dst,
                packet.psn,
                packet.tps
            );
            return None;
        }

        let key = (packet.src, packet.dst);

        let pending = self
            .pending
            .entry(key)
            .or_insert_with(|| PendingMessage::new(packet.tps, packet.is_broadcast()));

        if pending.tps != packet.tps {
            log::warn!(
                "abandoning partial message {}->{} ({} of {} packets)",
                packet.src,
                packet.dst,
                pending.received,
                pending.tps
            );
            *pending = PendingMessage::new(packet.tps, packet.is_broadcast());
        }

        pending.insert(packet.psn, packet.payload());

        if pending.is_complete() {
            let pending = self.pending.remove(&key)?;

            return Some(Message {
                src: key.0,
                dst: key.1,
                broadcast: pending.broadcast,
                data: pending.assemble(),
            });
        }

        None
    }

    /// Number of partially received messages.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::seq::SliceRandom;

    fn random_bytes(size: usize) -> Box<[u8]> {
        (0..size)
            .map(|_| rand::random::<u8>())
            .collect::<Vec<_>>()
            .into_boxed_slice()
    }

    #[test]
    fn fragment_fields() {
        let packets = fragment(3, 4, b"0123456789abcdefXY", true);

        assert_eq!(packets.len(), 3);

        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.psn, i as u32);
            assert_eq!(packet.tps, 3);
            assert_eq!(packet.src, 3);
            assert_eq!(packet.dst, 4);
            assert!(packet.is_broadcast());
            assert!(packet.verify_crc());
        }

        assert_eq!(packets[0].payload(), b"01234567");
        assert_eq!(packets[1].payload(), b"89abcdef");
        assert_eq!(packets[2].payload(), b"XY");
    }

    #[test]
    fn fragment_empty() {
        assert!(fragment(1, 2, &[], false).is_empty());
    }

    #[test]
    fn round_trip_any_order() {
        let mut rng = rand::thread_rng();
        let mut reassembler = Reassembler::new();

        for size in 1..=8 * 12 {
            let payload = random_bytes(size);

            for _ in 0..4 {
                let mut packets = fragment(7, 8, &payload, false);
                packets.shuffle(&mut rng);

                let (last, rest) = packets.split_last().unwrap();

                for packet in rest {
                    assert!(reassembler.insert(packet).is_none());
                }

                let message = reassembler.insert(last).expect("message incomplete");

                assert_eq!(message.data, payload);
                assert_eq!(message.src, 7);
                assert_eq!(message.dst, 8);
                assert!(!message.broadcast);
                assert_eq!(reassembler.pending_count(), 0);
            }
        }
    }

    #[test]
    fn largest_message_reassembles() {
        let payload: Vec<u8> = (0..MESSAGE_BYTES_MAX).map(|i| i as u8).collect();

        let packets = fragment(1, 2, &payload, false);
        assert_eq!(packets.len(), MESSAGE_PACKETS_MAX as usize);

        let mut reassembler = Reassembler::new();
        let message = packets.iter().find_map(|packet| reassembler.insert(packet)).unwrap();
        assert_eq!(&*message.data, &payload[..]);

        // One byte more needs a TPS the receiver refuses
        let oversize = fragment(1, 2, &vec![0u8; MESSAGE_BYTES_MAX + 1], false);
        assert!(reassembler.insert(&oversize[0]).is_none());
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn duplicates_counted_once() {
        let mut reassembler = Reassembler::new();
        let packets = fragment(1, 2, b"abcdefghijk", false);

        assert!(reassembler.insert(&packets[0]).is_none());
        assert!(reassembler.insert(&packets[0]).is_none());
        assert_eq!(reassembler.pending_count(), 1);

        let message = reassembler.insert(&packets[1]).unwrap();
        assert_eq!(&*message.data, b"abcdefghijk");
    }

    #[test]
    fn corrupted_packet_dropped() {
        let mut reassembler = Reassembler::new();
        let mut packets = fragment(1, 2, b"abcdefghijk", false);

        packets[1].data[0] ^= 0x01;

        assert!(reassembler.insert(&packets[0]).is_none());
        assert!(reassembler.insert(&packets[1]).is_none());
        assert_eq!(reassembler.pending_count(), 1);

        // Resending the intact packet completes the message
        packets[1].data[0] ^= 0x01;
        assert!(reassembler.insert(&packets[1]).is_some());
    }

    #[test]
    fn invalid_sequence_dropped() {
        let mut reassembler = Reassembler::new();

        let packet = Packet::new(1, 2, 3, 3, b"x", Flags::empty());
        assert!(reassembler.insert(&packet).is_none());

        let packet = Packet::new(1, 2, 0, 0, b"x", Flags::empty());
        assert!(reassembler.insert(&packet).is_none());

        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn pairs_reassembled_independently() {
        let mut reassembler = Reassembler::new();

        let a = fragment(1, 2, b"from one to two", false);
        let b = fragment(3, 2, b"from three to two", false);

        let mut completed = Vec::new();

        for packet in a.iter().zip(b.iter()).flat_map(|(x, y)| [x, y]) {
            completed.extend(reassembler.insert(packet));
        }
        for packet in b.iter().skip(a.len()) {
            completed.extend(reassembler.insert(packet));
        }

        assert_eq!(completed.len(), 2);
        assert!(completed.iter().any(|m| m.src == 1 && &*m.data == b"from one to two"));
        assert!(completed.iter().any(|m| m.src == 3 && &*m.data == b"from three to two"));
    }

    #[test]
    fn same_pair_messages_not_distinguished() {
        // Two interleaved messages of equal length between the same pair collapse into one
        let mut reassembler = Reassembler::new();

        let a = fragment(1, 2, b"AAAAAAAAaaaaaaaa", false);
        let b = fragment(1, 2, b"BBBBBBBBbbbbbbbb", false);

        assert!(reassembler.insert(&a[0]).is_none());
        let message = reassembler.insert(&b[1]).unwrap();

        assert_eq!(&*message.data, b"AAAAAAAAbbbbbbbb");
        assert!(reassembler.insert(&b[0]).is_none());
        assert!(reassembler.insert(&a[1]).is_some());
    }

    #[test]
    fn tps_change_restarts_message() {
        let mut reassembler = Reassembler::new();

        let long = fragment(1, 2, b"0123456789abcdefghij", false);
        let short = fragment(1, 2, b"xyz", false);

        assert!(reassembler.insert(&long[0]).is_none());

        let message = reassembler.insert(&short[0]).unwrap();
        assert_eq!(&*message.data, b"xyz");
        assert_eq!(reassembler.pending_count(), 0);
    }
}
