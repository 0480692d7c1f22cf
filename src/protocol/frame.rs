use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};

use crate::error::FrameError;

/// Frame prefix magic.
pub const PREFIX: u32 = 0x0000_55aa;
/// Frame suffix magic.
pub const SUFFIX: u32 = 0x0000_aa55;

/// prefix (4) + sequence (4) + command (4) + length (4)
pub const HEADER_SIZE: usize = 16;
/// checksum (4) + suffix (4)
pub const TRAILER_SIZE: usize = 8;
/// Largest frame accepted from a device.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Requests open a fresh connection each time, so the sequence never advances.
const SEQUENCE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Control = 0x07,
    Query = 0x0a,
}

impl CommandType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x07 => Some(CommandType::Control),
            0x0a => Some(CommandType::Query),
            _ => None,
        }
    }
}

/// Decoded frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plaintext JSON object.
    Json(Map<String, Value>),
    /// Anything that is not a JSON object; assumed to be ciphertext.
    Raw(Bytes),
    Empty,
}

/// A frame received from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command: u32,
    pub return_code: Option<u32>,
    pub payload: Payload,
}

impl Message {
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::from_u32(self.command)
    }
}

/// CRC-32 (IEEE) as used by the device firmware.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encode a request frame.
///
/// ```text
/// ┌────────────┬──────────┬──────────┬──────────┬─────────┬──────────┬────────────┐
/// │ 0x000055aa │ Sequence │ Command  │ Length   │ Payload │ CRC-32   │ 0x0000aa55 │
/// │ (4B BE)    │ (4B BE)  │ (4B BE)  │ (4B BE)  │         │ (4B BE)  │ (4B BE)    │
/// └────────────┴──────────┴──────────┴──────────┴─────────┴──────────┴────────────┘
/// ```
///
/// Length counts the payload plus the trailer. The CRC covers everything
/// from the prefix up to the end of the payload.
pub fn encode(payload: &[u8], command: CommandType) -> Bytes {
    let mut dst = BytesMut::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    dst.put_u32(PREFIX);
    dst.put_u32(SEQUENCE);
    dst.put_u32(command as u32);
    dst.put_u32((payload.len() + TRAILER_SIZE) as u32);
    dst.put_slice(payload);
    let crc = checksum(&dst);
    dst.put_u32(crc);
    dst.put_u32(SUFFIX);
    dst.freeze()
}

/// Total size of the frame at the head of `buf`, once its header has arrived.
///
/// Rejects a bad prefix as soon as four bytes are buffered, and a length
/// field outside `TRAILER_SIZE..=MAX_FRAME_SIZE - HEADER_SIZE` once the
/// header is complete.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() >= 4 {
        let prefix = read_u32(buf, 0);
        if prefix != PREFIX {
            return Err(FrameError::InvalidPrefix(prefix));
        }
    }
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let length = read_u32(buf, 12);
    let length_ok = (TRAILER_SIZE..=MAX_FRAME_SIZE - HEADER_SIZE).contains(&(length as usize));
    if !length_ok {
        return Err(FrameError::InvalidLength(length));
    }
    Ok(Some(HEADER_SIZE + length as usize))
}

/// Decode the frame at the head of `buf`, keeping the body intact.
/// Trailing bytes after the frame are ignored.
pub fn decode(buf: &[u8]) -> Result<Message, FrameError> {
    let (command, body) = parse(buf)?;
    Ok(Message {
        command,
        return_code: None,
        payload: classify(body),
    })
}

/// Decode a frame sent by a device.
///
/// Replies prefix the payload with a small return code; JSON and base64
/// payloads never start with three zero bytes, so a leading word below
/// 0x100 is split off into [`Message::return_code`].
pub fn decode_reply(buf: &[u8]) -> Result<Message, FrameError> {
    let (command, mut body) = parse(buf)?;

    let mut return_code = None;
    if body.len() >= 4 {
        let word = read_u32(body, 0);
        if word & 0xffff_ff00 == 0 {
            return_code = Some(word);
            body = &body[4..];
        }
    }

    Ok(Message {
        command,
        return_code,
        payload: classify(body),
    })
}

/// Validate framing and checksum; returns the command and the raw body.
fn parse(buf: &[u8]) -> Result<(u32, &[u8]), FrameError> {
    let min = HEADER_SIZE + TRAILER_SIZE;
    if buf.len() < min {
        return Err(FrameError::Truncated {
            got: buf.len(),
            need: min,
        });
    }

    let total = match frame_len(buf)? {
        Some(total) => total,
        None => {
            return Err(FrameError::Truncated {
                got: buf.len(),
                need: min,
            });
        }
    };
    if buf.len() < total {
        return Err(FrameError::Truncated {
            got: buf.len(),
            need: total,
        });
    }

    let suffix = read_u32(buf, total - 4);
    if suffix != SUFFIX {
        return Err(FrameError::InvalidSuffix(suffix));
    }

    let body_end = total - TRAILER_SIZE;
    let expected = checksum(&buf[..body_end]);
    let actual = read_u32(buf, body_end);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    Ok((read_u32(buf, 8), &buf[HEADER_SIZE..body_end]))
}

fn classify(body: &[u8]) -> Payload {
    if body.is_empty() {
        return Payload::Empty;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Payload::Json(map),
        _ => Payload::Raw(Bytes::copy_from_slice(body)),
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
