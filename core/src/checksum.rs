//! Checksum Module
//!
//! MD5 digests for chunk and whole-payload integrity checks.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Buffer size for hashing files (1MB)
const BUFFER_SIZE: usize = 1024 * 1024;

pub type Digest = [u8; 16];

/// MD5 of a single chunk
pub fn chunk_digest(data: &[u8]) -> Digest {
    md5::compute(data).into()
}

/// MD5 of a file on disk
pub fn file_digest(path: &Path) -> std::io::Result<Digest> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut digest = PayloadDigest::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        digest.update(&buffer[..n]);
    }

    Ok(digest.finish())
}

/// Hex rendering for log lines
pub fn to_hex(digest: &Digest) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Running digest over a payload streamed in chunks
pub struct PayloadDigest {
    context: md5::Context,
}

impl PayloadDigest {
    pub fn new() -> Self {
        PayloadDigest {
            context: md5::Context::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    pub fn finish(self) -> Digest {
        self.context.compute().into()
    }
}

impl Default for PayloadDigest {
    fn default() -> Self {
        Self::new()
    }
}
