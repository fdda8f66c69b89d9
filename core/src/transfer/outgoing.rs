//! Outbound transfer task: reads the payload in chunks and pushes frames to the peer.

use bytes::Bytes;
use std::fs::File;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::checksum::{chunk_digest, PayloadDigest};
use crate::endpoint::EndpointId;
use crate::medium::LocalMedium;
use crate::payload::{Payload, PayloadId, PayloadKind};
use crate::protocol::Frame;

use super::TransferTracker;

/// Where outbound bytes come from
pub(crate) enum Source {
    Memory(Bytes),
    File(tokio::fs::File),
}

impl Source {
    /// Open the payload for reading. File payloads must name a readable regular file.
    pub(crate) fn open(payload: &Payload) -> io::Result<Source> {
        match payload {
            Payload::Bytes(bytes) => Ok(Source::Memory(bytes.clone())),
            Payload::File { path, .. } => {
                let file = File::open(path)?;
                if file.metadata()?.is_dir() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "path is a directory",
                    ));
                }
                Ok(Source::File(tokio::fs::File::from_std(file)))
            }
        }
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::Memory(bytes) => {
                let start = (offset as usize).min(bytes.len());
                let n = buf.len().min(bytes.len() - start);
                buf[..n].copy_from_slice(&bytes[start..start + n]);
                Ok(n)
            }
            // Reads are sequential, so the cursor already sits at `offset`.
            Source::File(file) => file.read(buf).await,
        }
    }
}

pub(crate) struct OutgoingTransfer {
    pub(crate) local_id: EndpointId,
    pub(crate) remote_id: EndpointId,
    pub(crate) medium: LocalMedium,
    pub(crate) tracker: Arc<TransferTracker>,
    pub(crate) kind: PayloadKind,
    pub(crate) source: Source,
    pub(crate) total_bytes: u64,
    pub(crate) chunk_size: usize,
}

impl OutgoingTransfer {
    fn payload_id(&self) -> PayloadId {
        self.tracker.payload_id()
    }

    fn send(&self, frame: &Frame) -> bool {
        match self.medium.send(&self.local_id, &self.remote_id, frame.encode()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Transfer {} to {}: {}", self.payload_id(), self.remote_id, e);
                self.tracker.fail(format!("link failure: {}", e));
                false
            }
        }
    }

    /// Stream the payload. The tracker is completed later by the peer's ack.
    pub(crate) async fn run(mut self) {
        let payload_id = self.payload_id();

        tracing::debug!(
            "Starting transfer {} ({} bytes) to {}",
            payload_id,
            self.total_bytes,
            self.remote_id
        );

        if !self.send(&Frame::PayloadHeader {
            payload_id,
            kind: self.kind,
            total_size: self.total_bytes,
        }) {
            return;
        }

        let mut digest = PayloadDigest::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut offset = 0u64;

        while offset < self.total_bytes {
            if self.tracker.is_terminal() {
                tracing::info!("Transfer {} stopped at {} bytes", payload_id, offset);
                return;
            }

            let want = (self.total_bytes - offset).min(self.chunk_size as u64) as usize;
            let n = match self.source.read_at(offset, &mut buffer[..want]).await {
                Ok(0) => {
                    self.abort(format!(
                        "source ended at {} of {} bytes",
                        offset, self.total_bytes
                    ));
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    self.abort(format!("read error: {}", e));
                    return;
                }
            };

            let chunk = &buffer[..n];
            digest.update(chunk);
            let frame = Frame::PayloadChunk {
                payload_id,
                offset,
                digest: chunk_digest(chunk),
                data: Bytes::copy_from_slice(chunk),
            };
            if !self.send(&frame) {
                return;
            }

            offset += n as u64;
            self.tracker.progress(offset);
            tracing::trace!("Transfer {}: {}/{}", payload_id, offset, self.total_bytes);

            // Let the driver and other transfers interleave with large payloads.
            tokio::task::yield_now().await;
        }

        if self.tracker.is_terminal() {
            return;
        }
        self.send(&Frame::PayloadEnd {
            payload_id,
            digest: digest.finish(),
        });
    }

    fn abort(&self, reason: String) {
        tracing::warn!("Transfer {} aborted: {}", self.payload_id(), reason);
        if self.tracker.fail(reason) {
            let _ = self.medium.send(
                &self.local_id,
                &self.remote_id,
                Frame::PayloadCancel {
                    payload_id: self.payload_id(),
                }
                .encode(),
            );
        }
    }
}
