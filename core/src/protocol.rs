//! NearPeer Frame Protocol
//!
//! Byte layout of every frame carried by the medium.
//!
//! ```text
//! [MAGIC:2 "NP"][VERSION:u8][TYPE:u8][BODY...]
//! ```
//!
//! Integers are big-endian; strings are `[LEN:u16][UTF-8 bytes]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::checksum::Digest;
use crate::payload::{PayloadId, PayloadKind};

pub const MAGIC: [u8; 2] = *b"NP";

/// Protocol version (increment when changing frame layout)
pub const PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated")]
    Incomplete,
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("unknown payload kind {0}")]
    UnknownPayloadKind(u8),
    #[error("string field is not valid UTF-8")]
    InvalidString,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameType {
    ConnectRequest = 0x01,
    ConnectResponse = 0x02,
    Disconnect = 0x03,
    PayloadHeader = 0x10,
    PayloadChunk = 0x11,
    PayloadEnd = 0x12,
    PayloadAck = 0x13,
    PayloadCancel = 0x14,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameType::ConnectRequest),
            0x02 => Some(FrameType::ConnectResponse),
            0x03 => Some(FrameType::Disconnect),
            0x10 => Some(FrameType::PayloadHeader),
            0x11 => Some(FrameType::PayloadChunk),
            0x12 => Some(FrameType::PayloadEnd),
            0x13 => Some(FrameType::PayloadAck),
            0x14 => Some(FrameType::PayloadCancel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Sender asks to connect, announcing its display name
    ConnectRequest { name: String },
    /// Accept or reject of a pending connection
    ConnectResponse { accepted: bool },
    Disconnect,
    PayloadHeader {
        payload_id: PayloadId,
        kind: PayloadKind,
        total_size: u64,
    },
    PayloadChunk {
        payload_id: PayloadId,
        offset: u64,
        digest: Digest,
        data: Bytes,
    },
    /// Digest covers the whole payload
    PayloadEnd { payload_id: PayloadId, digest: Digest },
    PayloadAck { payload_id: PayloadId, ok: bool },
    PayloadCancel { payload_id: PayloadId },
}

impl Frame {
    fn frame_type(&self) -> FrameType {
        match self {
            Frame::ConnectRequest { .. } => FrameType::ConnectRequest,
            Frame::ConnectResponse { .. } => FrameType::ConnectResponse,
            Frame::Disconnect => FrameType::Disconnect,
            Frame::PayloadHeader { .. } => FrameType::PayloadHeader,
            Frame::PayloadChunk { .. } => FrameType::PayloadChunk,
            Frame::PayloadEnd { .. } => FrameType::PayloadEnd,
            Frame::PayloadAck { .. } => FrameType::PayloadAck,
            Frame::PayloadCancel { .. } => FrameType::PayloadCancel,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body_hint());
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.frame_type() as u8);

        match self {
            Frame::ConnectRequest { name } => put_string(&mut buf, name),
            Frame::ConnectResponse { accepted } => buf.put_u8(u8::from(*accepted)),
            Frame::Disconnect => {}
            Frame::PayloadHeader {
                payload_id,
                kind,
                total_size,
            } => {
                buf.put_u64(payload_id.0);
                buf.put_u8(*kind as u8);
                buf.put_u64(*total_size);
            }
            Frame::PayloadChunk {
                payload_id,
                offset,
                digest,
                data,
            } => {
                buf.put_u64(payload_id.0);
                buf.put_u64(*offset);
                buf.put_slice(digest);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Frame::PayloadEnd { payload_id, digest } => {
                buf.put_u64(payload_id.0);
                buf.put_slice(digest);
            }
            Frame::PayloadAck { payload_id, ok } => {
                buf.put_u64(payload_id.0);
                buf.put_u8(u8::from(*ok));
            }
            Frame::PayloadCancel { payload_id } => buf.put_u64(payload_id.0),
        }

        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.remaining() < HEADER_LEN {
            return Err(FrameError::Incomplete);
        }
        let magic = [buf.get_u8(), buf.get_u8()];
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let raw_type = buf.get_u8();
        let frame_type = FrameType::from_u8(raw_type).ok_or(FrameError::UnknownType(raw_type))?;

        let frame = match frame_type {
            FrameType::ConnectRequest => Frame::ConnectRequest {
                name: get_string(&mut buf)?,
            },
            FrameType::ConnectResponse => Frame::ConnectResponse {
                accepted: get_u8(&mut buf)? != 0,
            },
            FrameType::Disconnect => Frame::Disconnect,
            FrameType::PayloadHeader => {
                let payload_id = PayloadId(get_u64(&mut buf)?);
                let raw_kind = get_u8(&mut buf)?;
                let kind = PayloadKind::from_u8(raw_kind)
                    .ok_or(FrameError::UnknownPayloadKind(raw_kind))?;
                Frame::PayloadHeader {
                    payload_id,
                    kind,
                    total_size: get_u64(&mut buf)?,
                }
            }
            FrameType::PayloadChunk => {
                let payload_id = PayloadId(get_u64(&mut buf)?);
                let offset = get_u64(&mut buf)?;
                let digest = get_digest(&mut buf)?;
                let len = get_u32(&mut buf)? as usize;
                if buf.remaining() < len {
                    return Err(FrameError::Incomplete);
                }
                Frame::PayloadChunk {
                    payload_id,
                    offset,
                    digest,
                    data: buf.split_to(len),
                }
            }
            FrameType::PayloadEnd => Frame::PayloadEnd {
                payload_id: PayloadId(get_u64(&mut buf)?),
                digest: get_digest(&mut buf)?,
            },
            FrameType::PayloadAck => Frame::PayloadAck {
                payload_id: PayloadId(get_u64(&mut buf)?),
                ok: get_u8(&mut buf)? != 0,
            },
            FrameType::PayloadCancel => Frame::PayloadCancel {
                payload_id: PayloadId(get_u64(&mut buf)?),
            },
        };

        Ok(frame)
    }

    fn body_hint(&self) -> usize {
        match self {
            Frame::ConnectRequest { name } => 2 + name.len(),
            Frame::PayloadChunk { data, .. } => 8 + 8 + 16 + 4 + data.len(),
            _ => 32,
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    // Names longer than u16::MAX are cut on a char boundary
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u16(end as u16);
    buf.put_slice(&s.as_bytes()[..end]);
}

fn get_string(buf: &mut Bytes) -> Result<String, FrameError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(FrameError::Incomplete);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidString)
}

fn get_u8(buf: &mut Bytes) -> Result<u8, FrameError> {
    if buf.remaining() < 1 {
        return Err(FrameError::Incomplete);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::Incomplete);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, FrameError> {
    if buf.remaining() < 4 {
        return Err(FrameError::Incomplete);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, FrameError> {
    if buf.remaining() < 8 {
        return Err(FrameError::Incomplete);
    }
    Ok(buf.get_u64())
}

fn get_digest(buf: &mut Bytes) -> Result<Digest, FrameError> {
    if buf.remaining() < 16 {
        return Err(FrameError::Incomplete);
    }
    let mut digest = [0u8; 16];
    buf.copy_to_slice(&mut digest);
    Ok(digest)
}
