//! Payload types exchanged over a connection.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Largest byte payload a receiver buffers in memory; larger ones are refused
pub const MAX_BYTES_PAYLOAD: u64 = 32 * 1024 * 1024;

/// Identifier of a single payload transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PayloadId(pub u64);

impl PayloadId {
    pub fn random() -> Self {
        PayloadId(rand::random())
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    Bytes = 1,
    File = 2,
}

impl PayloadKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PayloadKind::Bytes),
            2 => Some(PayloadKind::File),
            _ => None,
        }
    }
}

/// Outbound payload
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Bytes),
    File { path: PathBuf, size: u64 },
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Bytes(_) => PayloadKind::Bytes,
            Payload::File { .. } => PayloadKind::File,
        }
    }

    pub fn total_size(&self) -> u64 {
        match self {
            Payload::Bytes(b) => b.len() as u64,
            Payload::File { size, .. } => *size,
        }
    }
}

/// A file payload spooled to local storage by the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub size: u64,
}

impl ReceivedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the spooled file for reading
    pub fn open(&self) -> std::io::Result<File> {
        File::open(&self.path)
    }
}

/// Fully received payload, as delivered to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedPayload {
    /// Byte payload that decoded as UTF-8
    Text(String),
    /// Byte payload that is not valid UTF-8
    Bytes(Bytes),
    File(ReceivedFile),
}

impl ReceivedPayload {
    pub(crate) fn from_bytes(data: Bytes) -> Self {
        match std::str::from_utf8(&data) {
            Ok(text) => ReceivedPayload::Text(text.to_string()),
            Err(_) => ReceivedPayload::Bytes(data),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ReceivedPayload::Text(t) => Some(t),
            _ => None,
        }
    }
}
