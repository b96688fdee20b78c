//! SpaceWire RMAP packet codec.
//!
//! Builds command packets, decodes the four packet shapes (command read,
//! command write, reply read, reply write) and validates their CRC-8 fields.
//! Decoding never fails on a malformed packet: CRC and length problems are
//! reported through the `*_valid` flags. Only packets too short to hold a
//! header decode to `None`.

pub mod transport;

use arrayvec::ArrayVec;
use crc::{Algorithm, Crc};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::error::TransportError;

pub const PROTOCOL_ID: u8 = 0x01;

/// Command header length, CRC excluded.
pub const COMMAND_HEADER_LEN: usize = 15;
/// Read reply header length, CRC excluded.
pub const READ_REPLY_HEADER_LEN: usize = 11;
/// Write replies are a bare header + CRC.
pub const WRITE_REPLY_LEN: usize = 8;
pub const MIN_PACKET_LEN: usize = WRITE_REPLY_LEN;

const_assert_eq!(COMMAND_HEADER_LEN, 1 + 1 + 1 + 1 + 1 + 2 + 1 + 4 + 3);
const_assert_eq!(READ_REPLY_HEADER_LEN, 1 + 1 + 1 + 1 + 1 + 2 + 1 + 3);

pub const MAX_DATA_LENGTH: u32 = 0x00FF_FFFF;

const PACKET_TYPE_SHIFT: u8 = 6;
const PACKET_TYPE_COMMAND: u8 = 0b01;
const PACKET_TYPE_REPLY: u8 = 0b00;
const FLAG_WRITE: u8 = 0x20;
const FLAG_VERIFY: u8 = 0x10;
const FLAG_REPLY: u8 = 0x08;
const FLAG_INCREMENT: u8 = 0x04;

/// CRC-8 of ECSS-E-ST-50-52C: x^8 + x^2 + x + 1, bit-reflected, zero seed.
pub const RMAP_CRC_ALGORITHM: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x07,
    init: 0x00,
    refin: true,
    refout: true,
    xorout: 0x00,
    check: 0x20,
    residue: 0x00,
};

const RMAP_CRC: Crc<u8> = Crc::<u8>::new(&RMAP_CRC_ALGORITHM);

pub fn crc8(bytes: &[u8]) -> u8 {
    RMAP_CRC.checksum(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RmapError {
    #[error("invalid hex data '{0}'")]
    InvalidHex(String),

    #[error("data length {0} does not fit in 24 bits")]
    LengthOutOfRange(u64),
}

impl From<RmapError> for TransportError {
    fn from(err: RmapError) -> Self {
        TransportError::Encoding(err.to_string())
    }
}

pub fn decode_hex(text: &str) -> Result<Vec<u8>, RmapError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.len() % 2 != 0 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RmapError::InvalidHex(text.to_string()));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| RmapError::InvalidHex(text.to_string()))
        })
        .collect()
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One command to encode. `data` is a hex string; `size` of zero means
/// "the decoded payload length".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RmapCommand {
    pub write: bool,
    pub verify: bool,
    pub reply: bool,
    pub increment: bool,
    pub address: u32,
    pub size: u32,
    pub data: String,
    pub extended_address: u8,
}

impl RmapCommand {
    pub fn read(address: u32, size: u32) -> Self {
        Self {
            reply: true,
            increment: true,
            address,
            size,
            ..Self::default()
        }
    }

    pub fn write(address: u32, data: impl Into<String>, verify: bool) -> Self {
        Self {
            write: true,
            verify,
            reply: true,
            increment: true,
            address,
            data: data.into(),
            ..Self::default()
        }
    }

    fn instruction(&self) -> u8 {
        let mut instruction = PACKET_TYPE_COMMAND << PACKET_TYPE_SHIFT;
        if self.write {
            instruction |= FLAG_WRITE;
        }
        if self.verify {
            instruction |= FLAG_VERIFY;
        }
        if self.reply {
            instruction |= FLAG_REPLY;
        }
        if self.increment {
            instruction |= FLAG_INCREMENT;
        }
        instruction
    }
}

/// Initiator-side encoder state.
#[derive(Debug, Clone)]
pub struct RmapCodec {
    pub target_address: u8,
    pub initiator_address: u8,
    pub key: u8,
    transaction_id: u16,
}

impl RmapCodec {
    pub fn new(target_address: u8, initiator_address: u8, key: u8) -> Self {
        Self {
            target_address,
            initiator_address,
            key,
            transaction_id: 1,
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    /// Id the next encoded command will carry.
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    fn advance_transaction_id(&mut self) {
        self.transaction_id = match self.transaction_id {
            u16::MAX => 1,
            id => id + 1,
        };
    }

    pub fn encode(&mut self, command: &RmapCommand) -> Result<Vec<u8>, RmapError> {
        let data = decode_hex(&command.data)?;
        let size = if command.size == 0 {
            u64::try_from(data.len()).unwrap_or(u64::MAX)
        } else {
            u64::from(command.size)
        };
        if size > u64::from(MAX_DATA_LENGTH) {
            return Err(RmapError::LengthOutOfRange(size));
        }

        let tid = self.transaction_id.to_be_bytes();
        let address = command.address.to_be_bytes();
        let length = (size as u32).to_be_bytes();

        let mut header: ArrayVec<u8, { COMMAND_HEADER_LEN + 1 }> = ArrayVec::new();
        header.push(self.target_address);
        header.push(PROTOCOL_ID);
        header.push(command.instruction());
        header.push(self.key);
        header.push(self.initiator_address);
        header.push(tid[0]);
        header.push(tid[1]);
        header.push(command.extended_address);
        header.extend(address);
        header.extend(length[1..].iter().copied());
        let header_crc = crc8(&header);
        header.push(header_crc);

        let mut packet = Vec::with_capacity(header.len() + data.len() + 1);
        packet.extend_from_slice(&header);
        if !data.is_empty() {
            packet.extend_from_slice(&data);
            packet.push(crc8(&data));
        }

        self.advance_transaction_id();
        Ok(packet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    CommandRead,
    CommandWrite,
    ReplyRead,
    ReplyWrite,
}

/// Decoded packet. Fields that a shape does not carry are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmapPacket {
    pub kind: PacketKind,
    pub target_address: u8,
    pub initiator_address: u8,
    pub protocol_id: u8,
    pub instruction: u8,
    pub write: bool,
    pub verify: bool,
    pub reply: bool,
    pub increment: bool,
    pub key: Option<u8>,
    pub status: Option<u8>,
    pub transaction_id: u16,
    pub extended_address: Option<u8>,
    pub address: Option<u32>,
    pub data_length: Option<u32>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub header_crc: u8,
    pub data_crc: Option<u8>,
    pub header_crc_valid: bool,
    pub data_crc_valid: bool,
    pub length_valid: bool,
    pub valid: bool,
}

impl RmapPacket {
    fn finish(mut self) -> Self {
        self.valid = self.protocol_id == PROTOCOL_ID
            && self.header_crc_valid
            && self.data_crc_valid
            && self.length_valid;
        self
    }
}

fn be24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

/// Splits `rest` into payload + trailing CRC and checks it.
fn split_data(rest: &[u8]) -> (Vec<u8>, Option<u8>, bool) {
    match rest.split_last() {
        None => (Vec::new(), None, true),
        Some((&crc, data)) => (data.to_vec(), Some(crc), crc8(data) == crc),
    }
}

pub fn decode(bytes: &[u8]) -> Option<RmapPacket> {
    if bytes.len() < MIN_PACKET_LEN {
        return None;
    }

    let instruction = bytes[2];
    let packet_type = instruction >> PACKET_TYPE_SHIFT;
    let write = instruction & FLAG_WRITE != 0;

    let mut packet = RmapPacket {
        kind: PacketKind::ReplyWrite,
        target_address: 0,
        initiator_address: 0,
        protocol_id: bytes[1],
        instruction,
        write,
        verify: instruction & FLAG_VERIFY != 0,
        reply: instruction & FLAG_REPLY != 0,
        increment: instruction & FLAG_INCREMENT != 0,
        key: None,
        status: None,
        transaction_id: u16::from_be_bytes([bytes[5], bytes[6]]),
        extended_address: None,
        address: None,
        data_length: None,
        data: Vec::new(),
        header_crc: 0,
        data_crc: None,
        header_crc_valid: false,
        data_crc_valid: true,
        length_valid: true,
        valid: false,
    };

    match (packet_type, write) {
        (PACKET_TYPE_COMMAND, _) => {
            packet.kind = if write {
                PacketKind::CommandWrite
            } else {
                PacketKind::CommandRead
            };
            packet.target_address = bytes[0];
            packet.key = Some(bytes[3]);
            packet.initiator_address = bytes[4];
            packet.extended_address = Some(bytes[7]);
            packet.address = bytes
                .get(8..12)
                .map(|a| u32::from_be_bytes([a[0], a[1], a[2], a[3]]));
            packet.data_length = bytes.get(12..15).map(be24);
            // Truncated header: report what is there, flagged invalid.
            let (Some(declared), Some(&header_crc)) = (packet.data_length, bytes.get(COMMAND_HEADER_LEN)) else {
                packet.length_valid = false;
                return Some(packet.finish());
            };
            packet.header_crc = header_crc;
            packet.header_crc_valid = crc8(&bytes[..COMMAND_HEADER_LEN]) == header_crc;

            let rest = &bytes[COMMAND_HEADER_LEN + 1..];
            if write {
                let (data, data_crc, data_crc_valid) = split_data(rest);
                packet.length_valid = data.len() == declared as usize;
                packet.data = data;
                packet.data_crc = data_crc;
                packet.data_crc_valid = data_crc_valid;
            } else {
                packet.length_valid = rest.is_empty();
            }
        }
        (PACKET_TYPE_REPLY, true) => {
            packet.kind = PacketKind::ReplyWrite;
            packet.initiator_address = bytes[0];
            packet.status = Some(bytes[3]);
            packet.target_address = bytes[4];
            packet.header_crc = bytes[WRITE_REPLY_LEN - 1];
            packet.header_crc_valid = crc8(&bytes[..WRITE_REPLY_LEN - 1]) == packet.header_crc;
            packet.length_valid = bytes.len() == WRITE_REPLY_LEN;
        }
        (PACKET_TYPE_REPLY, false) => {
            packet.kind = PacketKind::ReplyRead;
            packet.initiator_address = bytes[0];
            packet.status = Some(bytes[3]);
            packet.target_address = bytes[4];
            packet.data_length = bytes.get(8..11).map(be24);
            let (Some(declared), Some(&header_crc)) = (packet.data_length, bytes.get(READ_REPLY_HEADER_LEN)) else {
                packet.length_valid = false;
                return Some(packet.finish());
            };
            packet.header_crc = header_crc;
            packet.header_crc_valid = crc8(&bytes[..READ_REPLY_HEADER_LEN]) == header_crc;

            let (data, data_crc, data_crc_valid) = split_data(&bytes[READ_REPLY_HEADER_LEN + 1..]);
            packet.length_valid = data.len() == declared as usize;
            packet.data = data;
            packet.data_crc = data_crc;
            packet.data_crc_valid = data_crc_valid;
        }
        _ => return None,
    }

    Some(packet.finish())
}

/// Target-side reply to a decoded command. `data` is only used for reads.
/// Returns `None` when `command` is not a command packet.
pub fn encode_reply(command: &RmapPacket, status: u8, data: &[u8]) -> Option<Vec<u8>> {
    let instruction = (command.instruction & !(0b11 << PACKET_TYPE_SHIFT)) | (PACKET_TYPE_REPLY << PACKET_TYPE_SHIFT);
    let tid = command.transaction_id.to_be_bytes();

    let mut header = vec![
        command.initiator_address,
        PROTOCOL_ID,
        instruction,
        status,
        command.target_address,
        tid[0],
        tid[1],
    ];

    match command.kind {
        PacketKind::CommandWrite => {
            header.push(crc8(&header));
            Some(header)
        }
        PacketKind::CommandRead => {
            let length = u32::try_from(data.len()).ok().filter(|l| *l <= MAX_DATA_LENGTH)?;
            header.push(0);
            header.extend_from_slice(&length.to_be_bytes()[1..]);
            header.push(crc8(&header));
            header.extend_from_slice(data);
            header.push(crc8(data));
            Some(header)
        }
        PacketKind::ReplyRead | PacketKind::ReplyWrite => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_table() {
        assert_eq!(crc8(&[]), 0x00);
        assert_eq!(crc8(&[0x01]), 0x91);
        assert_eq!(crc8(&[0x02]), 0xE3);
        assert_eq!(crc8(&[0x03]), 0x72);
        assert_eq!(crc8(b"123456789"), 0x20);
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(decode_hex("0x0a0B"), Ok(vec![0x0a, 0x0b]));
        assert_eq!(decode_hex(""), Ok(vec![]));
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
        assert_eq!(encode_hex(&[0xde, 0xad, 0x01]), "dead01");
    }
}
