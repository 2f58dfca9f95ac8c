//! ZRE wire codec — UDP beacons and the binary peer message set.
//!
//! Everything exchanged over UDP (discovery) and TCP (peer links) is defined
//! here so that every sub-module speaks the same language.
//!
//! Two encodings live side by side:
//!
//! * the fixed 22-byte discovery **beacon** broadcast over UDP, and
//! * the variable-length **ZRE messages** (`0xAA 0xA1` signature, message id,
//!   protocol version 2) carried over TCP peer links.
//!
//! On a peer link every unit is length-delimited: a 4-byte big-endian length
//! prefix followed by the body. The first frame after connect is the sender's
//! raw 16-byte UUID (the routing identity); every later frame is one encoded
//! ZRE message.

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::DecodeError;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Leading bytes of every discovery beacon.
pub const BEACON_PREFIX: &[u8; 3] = b"ZRE";

/// Beacon layout version.
pub const BEACON_VERSION: u8 = 0x01;

/// Exact size of a beacon datagram.
pub const BEACON_SIZE: usize = 22;

/// UDP port used for broadcast discovery (IANA-assigned for ZRE).
pub const DISCOVERY_PORT: u16 = 5670;

/// Two-byte signature opening every ZRE message.
pub const ZRE_SIGNATURE: [u8; 2] = [0xAA, 0xA1];

/// ZRE protocol version carried in every message.
pub const ZRE_VERSION: u8 = 2;

/// Maximum allowed frame size on a peer link to avoid unbounded allocations
/// from a misbehaving peer.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

// ────────────────────────────────────────────────────────────────────────────
// Beacon
// ────────────────────────────────────────────────────────────────────────────

/// Discovery beacon: `"ZRE"`, version, sender UUID, inbox TCP port.
///
/// A port of 0 announces that the sender is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub uuid: Uuid,
    pub port: u16,
}

impl Beacon {
    pub fn encode(&self) -> [u8; BEACON_SIZE] {
        let mut buf = [0u8; BEACON_SIZE];
        buf[..3].copy_from_slice(BEACON_PREFIX);
        buf[3] = BEACON_VERSION;
        buf[4..20].copy_from_slice(self.uuid.as_bytes());
        buf[20..22].copy_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// Decode a datagram. Returns `None` when the length, prefix, or
    /// version does not match; such datagrams are silently dropped.
    pub fn decode(data: &[u8]) -> Option<Beacon> {
        if data.len() != BEACON_SIZE {
            return None;
        }
        if &data[..3] != BEACON_PREFIX || data[3] != BEACON_VERSION {
            return None;
        }
        let uuid = Uuid::from_slice(&data[4..20]).ok()?;
        let port = u16::from_be_bytes([data[20], data[21]]);
        Some(Beacon { uuid, port })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ZRE messages
// ────────────────────────────────────────────────────────────────────────────

/// The ZRE peer message set.
///
/// `seq` is stamped by the sending peer immediately before encoding; a
/// freshly built message carries 0 until [`ZreMsg::set_seq`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZreMsg {
    Hello {
        seq: u16,
        endpoint: String,
        groups: Vec<String>,
        status: u8,
        name: String,
        headers: HashMap<String, String>,
    },
    Whisper {
        seq: u16,
        content: Vec<Vec<u8>>,
    },
    Shout {
        seq: u16,
        group: String,
        content: Vec<Vec<u8>>,
    },
    Join {
        seq: u16,
        group: String,
        status: u8,
    },
    Leave {
        seq: u16,
        group: String,
        status: u8,
    },
    Ping {
        seq: u16,
    },
    PingOk {
        seq: u16,
    },
}

impl ZreMsg {
    /// Wire id of this message.
    pub fn id(&self) -> u8 {
        match self {
            ZreMsg::Hello { .. } => 1,
            ZreMsg::Whisper { .. } => 2,
            ZreMsg::Shout { .. } => 3,
            ZreMsg::Join { .. } => 4,
            ZreMsg::Leave { .. } => 5,
            ZreMsg::Ping { .. } => 6,
            ZreMsg::PingOk { .. } => 7,
        }
    }

    /// Human-readable label for log messages.
    pub fn name(&self) -> &'static str {
        match self {
            ZreMsg::Hello { .. } => "HELLO",
            ZreMsg::Whisper { .. } => "WHISPER",
            ZreMsg::Shout { .. } => "SHOUT",
            ZreMsg::Join { .. } => "JOIN",
            ZreMsg::Leave { .. } => "LEAVE",
            ZreMsg::Ping { .. } => "PING",
            ZreMsg::PingOk { .. } => "PING-OK",
        }
    }

    pub fn seq(&self) -> u16 {
        match self {
            ZreMsg::Hello { seq, .. }
            | ZreMsg::Whisper { seq, .. }
            | ZreMsg::Shout { seq, .. }
            | ZreMsg::Join { seq, .. }
            | ZreMsg::Leave { seq, .. }
            | ZreMsg::Ping { seq }
            | ZreMsg::PingOk { seq } => *seq,
        }
    }

    pub fn set_seq(&mut self, value: u16) {
        match self {
            ZreMsg::Hello { seq, .. }
            | ZreMsg::Whisper { seq, .. }
            | ZreMsg::Shout { seq, .. }
            | ZreMsg::Join { seq, .. }
            | ZreMsg::Leave { seq, .. }
            | ZreMsg::Ping { seq }
            | ZreMsg::PingOk { seq } => *seq = value,
        }
    }

    /// Encode into a wire frame (signature, id, version, body).
    ///
    /// Short-string fields (names, groups, header keys) must be at most 255
    /// bytes; the node validates owner-supplied values before they get here.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&ZRE_SIGNATURE);
        buf.push(self.id());
        buf.push(ZRE_VERSION);
        match self {
            ZreMsg::Hello {
                seq,
                endpoint,
                groups,
                status,
                name,
                headers,
            } => {
                put_u16(&mut buf, *seq);
                put_short_str(&mut buf, endpoint);
                put_u32(&mut buf, groups.len() as u32);
                for group in groups {
                    put_short_str(&mut buf, group);
                }
                buf.push(*status);
                put_short_str(&mut buf, name);
                put_u32(&mut buf, headers.len() as u32);
                let mut keys: Vec<&String> = headers.keys().collect();
                keys.sort();
                for key in keys {
                    put_short_str(&mut buf, key);
                    put_long_str(&mut buf, &headers[key]);
                }
            }
            ZreMsg::Whisper { seq, content } => {
                put_u16(&mut buf, *seq);
                put_content(&mut buf, content);
            }
            ZreMsg::Shout {
                seq,
                group,
                content,
            } => {
                put_u16(&mut buf, *seq);
                put_short_str(&mut buf, group);
                put_content(&mut buf, content);
            }
            ZreMsg::Join { seq, group, status } | ZreMsg::Leave { seq, group, status } => {
                put_u16(&mut buf, *seq);
                put_short_str(&mut buf, group);
                buf.push(*status);
            }
            ZreMsg::Ping { seq } | ZreMsg::PingOk { seq } => {
                put_u16(&mut buf, *seq);
            }
        }
        buf
    }

    /// Decode a wire frame. The whole frame must be consumed; trailing
    /// bytes are rejected so that `encode(decode(f)) == f` holds for every
    /// accepted frame.
    pub fn decode(data: &[u8]) -> Result<ZreMsg, DecodeError> {
        let mut cur = Cursor::new(data);
        let signature = [cur.u8()?, cur.u8()?];
        if signature != ZRE_SIGNATURE {
            return Err(DecodeError::BadSignature);
        }
        let id = cur.u8()?;
        let version = cur.u8()?;
        if version != ZRE_VERSION {
            return Err(DecodeError::BadVersion(version));
        }
        let msg = match id {
            1 => {
                let seq = cur.u16()?;
                let endpoint = cur.short_str()?;
                let group_count = cur.count()?;
                let mut groups = Vec::with_capacity(group_count);
                for _ in 0..group_count {
                    groups.push(cur.short_str()?);
                }
                let status = cur.u8()?;
                let name = cur.short_str()?;
                let header_count = cur.count()?;
                let mut headers = HashMap::with_capacity(header_count);
                for _ in 0..header_count {
                    let key = cur.short_str()?;
                    let value = cur.long_str()?;
                    headers.insert(key, value);
                }
                ZreMsg::Hello {
                    seq,
                    endpoint,
                    groups,
                    status,
                    name,
                    headers,
                }
            }
            2 => ZreMsg::Whisper {
                seq: cur.u16()?,
                content: cur.content()?,
            },
            3 => ZreMsg::Shout {
                seq: cur.u16()?,
                group: cur.short_str()?,
                content: cur.content()?,
            },
            4 => ZreMsg::Join {
                seq: cur.u16()?,
                group: cur.short_str()?,
                status: cur.u8()?,
            },
            5 => ZreMsg::Leave {
                seq: cur.u16()?,
                group: cur.short_str()?,
                status: cur.u8()?,
            },
            6 => ZreMsg::Ping { seq: cur.u16()? },
            7 => ZreMsg::PingOk { seq: cur.u16()? },
            other => return Err(DecodeError::UnknownId(other)),
        };
        if cur.remaining() > 0 {
            return Err(DecodeError::TrailingBytes(cur.remaining()));
        }
        Ok(msg)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Field writers
// ────────────────────────────────────────────────────────────────────────────

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Short string: 1-byte length prefix. Callers keep these under 256 bytes.
fn put_short_str(buf: &mut Vec<u8>, value: &str) {
    debug_assert!(value.len() <= u8::MAX as usize);
    buf.push(value.len().min(u8::MAX as usize) as u8);
    buf.extend_from_slice(&value.as_bytes()[..value.len().min(u8::MAX as usize)]);
}

/// Long string: 4-byte big-endian length prefix.
fn put_long_str(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

/// Payload frames: frame count, then a length-prefixed blob per frame.
fn put_content(buf: &mut Vec<u8>, content: &[Vec<u8>]) {
    put_u32(buf, content.len() as u32);
    for frame in content {
        put_u32(buf, frame.len() as u32);
        buf.extend_from_slice(frame);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Field reader
// ────────────────────────────────────────────────────────────────────────────

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Collection count. Each element takes at least one byte, so a count
    /// larger than the remaining input is truncation, not an allocation
    /// request.
    fn count(&mut self) -> Result<usize, DecodeError> {
        let count = self.u32()? as usize;
        if count > self.remaining() {
            return Err(DecodeError::Truncated);
        }
        Ok(count)
    }

    fn short_str(&mut self) -> Result<String, DecodeError> {
        let len = self.u8()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8)
    }

    fn long_str(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8)
    }

    fn content(&mut self) -> Result<Vec<Vec<u8>>, DecodeError> {
        let count = self.count()?;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let len = self.u32()? as usize;
            frames.push(self.bytes(len)?.to_vec());
        }
        Ok(frames)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Link framing helpers
// ────────────────────────────────────────────────────────────────────────────

/// Write one length-prefixed frame to a peer link.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

/// Read one length-prefixed frame from a peer link, enforcing
/// [`MAX_FRAME_SIZE`].
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
