//! Inbound payload reassembly.

use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::checksum::{chunk_digest, to_hex, Digest, PayloadDigest};
use crate::endpoint::EndpointId;
use crate::payload::{
    PayloadId, PayloadKind, ReceivedFile, ReceivedPayload, MAX_BYTES_PAYLOAD,
};

use super::TransferTracker;

#[derive(Error, Debug)]
pub(crate) enum IncomingError {
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk at offset {got}, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("chunk at offset {0} failed checksum verification")]
    ChunkDigestMismatch(u64),
    #[error("payload exceeds declared size of {0} bytes")]
    Overflow(u64),
    #[error("payload ended at {received} of {total} bytes")]
    Truncated { received: u64, total: u64 },
    #[error("payload checksum mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("byte payload of {0} bytes is too large")]
    TooLarge(u64),
}

enum Sink {
    Memory(BytesMut),
    File {
        file: tokio::fs::File,
        path: PathBuf,
    },
}

pub(crate) struct IncomingTransfer {
    pub(crate) tracker: Arc<TransferTracker>,
    total: u64,
    received: u64,
    digest: PayloadDigest,
    /// Taken when the payload is handed over or discarded
    sink: Option<Sink>,
}

impl IncomingTransfer {
    pub(crate) async fn create(
        tracker: Arc<TransferTracker>,
        from: &EndpointId,
        kind: PayloadKind,
        total: u64,
        spool_dir: &Path,
    ) -> Result<Self, IncomingError> {
        let sink = match kind {
            PayloadKind::Bytes => {
                if total > MAX_BYTES_PAYLOAD {
                    return Err(IncomingError::TooLarge(total));
                }
                Sink::Memory(BytesMut::with_capacity(total as usize))
            }
            PayloadKind::File => {
                let path = spool_path(spool_dir, from, tracker.payload_id());
                let file = tokio::fs::File::create(&path).await?;
                tracing::debug!("Spooling payload {} to {:?}", tracker.payload_id(), path);
                Sink::File { file, path }
            }
        };

        Ok(IncomingTransfer {
            tracker,
            total,
            received: 0,
            digest: PayloadDigest::new(),
            sink: Some(sink),
        })
    }

    pub(crate) fn received(&self) -> u64 {
        self.received
    }

    /// Append the next chunk after verifying its position and checksum
    pub(crate) async fn write_chunk(
        &mut self,
        offset: u64,
        digest: &Digest,
        data: &Bytes,
    ) -> Result<(), IncomingError> {
        if offset != self.received {
            return Err(IncomingError::OutOfOrder {
                expected: self.received,
                got: offset,
            });
        }
        if chunk_digest(data) != *digest {
            return Err(IncomingError::ChunkDigestMismatch(offset));
        }
        let end = self.received + data.len() as u64;
        if end > self.total {
            return Err(IncomingError::Overflow(self.total));
        }

        match &mut self.sink {
            Some(Sink::Memory(buf)) => buf.extend_from_slice(data),
            Some(Sink::File { file, .. }) => file.write_all(data).await?,
            None => return Err(IncomingError::Overflow(self.total)),
        }
        self.digest.update(data);
        self.received = end;
        self.tracker.progress(end);
        Ok(())
    }

    /// Verify the whole payload and hand it over
    pub(crate) async fn finish(mut self, expected: &Digest) -> Result<ReceivedPayload, IncomingError> {
        if self.received != self.total {
            let err = IncomingError::Truncated {
                received: self.received,
                total: self.total,
            };
            self.discard().await;
            return Err(err);
        }

        let actual = std::mem::take(&mut self.digest).finish();
        if actual != *expected {
            let err = IncomingError::DigestMismatch {
                expected: to_hex(expected),
                actual: to_hex(&actual),
            };
            self.discard().await;
            return Err(err);
        }

        match self.sink.take() {
            Some(Sink::Memory(buf)) => Ok(ReceivedPayload::from_bytes(buf.freeze())),
            Some(Sink::File { mut file, path }) => {
                let synced = async {
                    file.flush().await?;
                    file.sync_all().await
                }
                .await;
                if let Err(e) = synced {
                    drop(file);
                    remove_spool(&path).await;
                    return Err(e.into());
                }
                Ok(ReceivedPayload::File(ReceivedFile {
                    path,
                    size: self.total,
                }))
            }
            None => Err(IncomingError::Truncated {
                received: self.received,
                total: self.total,
            }),
        }
    }

    /// Drop buffered data and remove any spool file
    pub(crate) async fn discard(mut self) {
        if let Some(Sink::File { file, path }) = self.sink.take() {
            drop(file);
            remove_spool(&path).await;
        }
    }
}

impl Drop for IncomingTransfer {
    fn drop(&mut self) {
        // Still holding a spool file means the payload was never handed over.
        if let Some(Sink::File { file, path }) = self.sink.take() {
            drop(file);
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed partial spool file {:?}", path),
                Err(e) => tracing::debug!("Could not remove spool file {:?}: {}", path, e),
            }
        }
    }
}

fn spool_path(dir: &Path, from: &EndpointId, payload_id: PayloadId) -> PathBuf {
    dir.join(format!("nearpeer-{}-{}.bin", from, payload_id))
}

async fn remove_spool(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!("Could not remove spool file {:?}: {}", path, e);
    }
}
