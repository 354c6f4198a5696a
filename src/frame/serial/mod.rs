mod crc;

use super::*;
use crate::error::{Error, Result};

const DLC_OFFSET: usize = 16;

pub struct Reader<'a> {
    buffer: &'a [u8],
    bytes_read: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.buffer[self.bytes_read..self.bytes_read + N]);
        self.bytes_read += N;
        bytes
    }

    pub fn read_u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    pub fn read_u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    pub fn read_u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    pub fn read_u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }
}

pub struct Writer<'a> {
    buffer: &'a mut [u8],
    bytes_written: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.buffer[self.bytes_written..self.bytes_written + bytes.len()].copy_from_slice(bytes);
        self.bytes_written += bytes.len();
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_slice(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_slice(&value.to_be_bytes());
    }
}

pub fn crc16(data: &[u8]) -> u16 {
    crc::compute(data)
}

/// Serializes a packet into its fixed wire representation. The carried CRC is written as-is.
pub fn write_packet(packet: &Packet) -> [u8; PACKET_SIZE] {
    let mut buffer = [0u8; PACKET_SIZE];

    let mut wr = Writer::new(&mut buffer);
    wr.write_u32(packet.psn);
    wr.write_u32(packet.tps);
    wr.write_u32(packet.src);
    wr.write_u32(packet.dst);
    wr.write_u8(packet.dlc);
    wr.write_u8(packet.flags.bits());
    wr.write_u16(packet.crc);
    wr.write_u64(packet.timestamp);
    wr.write_slice(&packet.data);

    debug_assert_eq!(wr.bytes_written(), PACKET_SIZE);

    buffer
}

/// Parses one packet. Fails if the buffer is not exactly one packet long, if the DLC is out of
/// range, or if the CRC does not match the payload.
pub fn read_packet(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() != PACKET_SIZE {
        return Err(Error::InvalidPacket("wrong packet size"));
    }

    if bytes[DLC_OFFSET] as usize > PAYLOAD_SIZE_MAX {
        return Err(Error::InvalidPacket("data length code out of range"));
    }

    let mut rd = Reader::new(bytes);

    let psn = rd.read_u32();
    let tps = rd.read_u32();
    let src = rd.read_u32();
    let dst = rd.read_u32();
    let dlc = rd.read_u8();
    let flags = Flags::from_bits_truncate(rd.read_u8());
    let crc = rd.read_u16();
    let timestamp = rd.read_u64();

    let mut data = [0u8; PAYLOAD_SIZE_MAX];
    data.copy_from_slice(&bytes[rd.bytes_read()..]);

    let packet = Packet {
        psn,
        tps,
        src,
        dst,
        dlc,
        crc,
        timestamp,
        flags,
        data,
    };

    let computed = packet.compute_crc();

    if computed != crc {
        return Err(Error::CrcMismatch {
            carried: crc,
            computed,
        });
    }

    Ok(packet)
}
