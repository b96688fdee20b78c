//! RMAP over TCP: each packet is framed as a big-endian `u32` length
//! followed by the raw packet bytes.
//!
//! Commands are text so that declarative templates can drive them:
//!
//! ```text
//! read  <address> <size> [extended_address]
//! write <address> <hexdata> [extended_address]
//! ```
//!
//! Numbers are decimal or `0x`-prefixed hex. A query returns the read data
//! as a lowercase hex string (empty for writes).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{decode, encode_hex, PacketKind, RmapCodec, RmapCommand, RmapPacket, MAX_DATA_LENGTH};
use crate::error::TransportError;
use crate::instrument::config::InstrumentConfig;
use crate::instrument::transport::{connect_tcp, Transport};

/// Largest accepted frame: a full command header, its CRC, the maximum
/// payload and the payload CRC.
pub const MAX_FRAME_LEN: usize = 16 + MAX_DATA_LENGTH as usize + 1;

const READ_CHUNK: usize = 4096;

pub fn write_frame<W: Write>(writer: &mut W, packet: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(packet.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too long"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(packet)?;
    writer.flush()
}

pub fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut packet = vec![0u8; len];
    reader.read_exact(&mut packet)?;
    Ok(packet)
}

/// Reassembles length-prefixed frames from whatever the socket returns. A
/// frame cut short by a timeout stays buffered, so a late reply is decoded
/// whole on the next exchange instead of desynchronizing the stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Takes the next complete frame. `Err` carries an impossible length
    /// prefix; the buffer is then cleared.
    pub fn take_frame(&mut self) -> Result<Option<Vec<u8>>, usize> {
        let Some(prefix) = self.pending.get(..4) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len > MAX_FRAME_LEN {
            self.pending.clear();
            return Err(len);
        }
        if self.pending.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.pending[4..4 + len].to_vec();
        self.pending.drain(..4 + len);
        Ok(Some(frame))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn parse_number(token: &str) -> Result<u32, TransportError> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => token.parse::<u32>(),
    };
    parsed.map_err(|_| TransportError::InvalidCommand(format!("'{token}' is not a number")))
}

/// Parses one textual RMAP command.
pub fn parse_command(text: &str, verify: bool) -> Result<RmapCommand, TransportError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let invalid = || TransportError::InvalidCommand(text.to_string());

    let (op, address, operand, extended) = match tokens.as_slice() {
        [op, address, operand] => (*op, *address, *operand, None),
        [op, address, operand, ext] => (*op, *address, *operand, Some(*ext)),
        _ => return Err(invalid()),
    };

    let address = parse_number(address)?;
    let mut command = match op.to_ascii_lowercase().as_str() {
        "read" => RmapCommand::read(address, parse_number(operand)?),
        "write" => RmapCommand::write(address, operand, verify),
        _ => return Err(invalid()),
    };
    if let Some(ext) = extended {
        command.extended_address = u8::try_from(parse_number(ext)?).map_err(|_| invalid())?;
    }
    Ok(command)
}

pub struct RmapTransport {
    stream: TcpStream,
    frames: FrameBuffer,
    codec: RmapCodec,
    verify: bool,
    timeout: Duration,
}

impl RmapTransport {
    pub fn connect(config: &InstrumentConfig) -> Result<Self, TransportError> {
        let stream = connect_tcp(config)?;
        let settings = &config.rmap;
        debug!(
            provider = %config.provider,
            target = settings.target_address,
            initiator = settings.initiator_address,
            "rmap link up"
        );
        Ok(Self {
            stream,
            frames: FrameBuffer::default(),
            codec: RmapCodec::new(settings.target_address, settings.initiator_address, settings.key),
            verify: settings.verify,
            timeout: config.timeout(),
        })
    }

    /// Sends `text` and waits for the reply carrying the same transaction id.
    fn transact(&mut self, text: &str) -> Result<RmapPacket, TransportError> {
        let command = parse_command(text, self.verify)?;
        let transaction_id = self.codec.transaction_id();
        let packet = self.codec.encode(&command)?;
        trace!(transaction_id, bytes = packet.len(), "rmap command");
        write_frame(&mut self.stream, &packet)?;

        let expected = if command.write {
            PacketKind::ReplyWrite
        } else {
            PacketKind::ReplyRead
        };
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.frames.take_frame() {
                Ok(Some(frame)) => match check_reply(&frame, transaction_id, expected)? {
                    Some(reply) => return Ok(reply),
                    None => continue,
                },
                Ok(None) => {}
                Err(len) => {
                    warn!(len, "impossible rmap frame length, dropping buffered bytes");
                    return Err(TransportError::RmapReply);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(transaction_id, buffered = self.frames.len(), "rmap reply timed out");
                return Err(TransportError::RmapReply);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => self.frames.extend(&chunk[..n]),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                    warn!(transaction_id, buffered = self.frames.len(), "rmap reply timed out");
                    return Err(TransportError::RmapReply);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// `Ok(None)` for a reply to an earlier transaction.
fn check_reply(frame: &[u8], transaction_id: u16, expected: PacketKind) -> Result<Option<RmapPacket>, TransportError> {
    let Some(reply) = decode(frame) else {
        warn!(bytes = frame.len(), "undecodable rmap reply");
        return Err(TransportError::RmapReply);
    };
    if reply.transaction_id != transaction_id {
        debug!(expected = transaction_id, got = reply.transaction_id, "discarding stale rmap reply");
        return Ok(None);
    }
    if !reply.valid || reply.kind != expected || reply.status != Some(0) {
        warn!(
            transaction_id,
            status = ?reply.status,
            valid = reply.valid,
            "rmap reply rejected"
        );
        return Err(TransportError::RmapReply);
    }
    Ok(Some(reply))
}

impl Transport for RmapTransport {
    fn kind(&self) -> &'static str {
        "rmap"
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.transact(command).map(drop)
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let reply = self.transact(command)?;
        Ok(encode_hex(&reply.data))
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
