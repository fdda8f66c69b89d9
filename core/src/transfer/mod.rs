//! Payload Transfer Module
//!
//! Progress tracking shared by outbound and inbound transfers. A tracker
//! publishes [`TransferStatus`] values; bytes only ever grow, and the first
//! terminal outcome is final.

pub(crate) mod incoming;
pub(crate) mod outgoing;

use serde::Serialize;
use tokio::sync::watch;

use crate::endpoint::EndpointId;
use crate::event::{Emitter, SessionEvent};
use crate::payload::PayloadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferOutcome {
    InProgress,
    Success,
    Failure(String),
}

impl TransferOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferOutcome::InProgress)
    }
}

/// Snapshot of a single transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferStatus {
    pub payload_id: PayloadId,
    pub direction: TransferDirection,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub outcome: TransferOutcome,
}

impl TransferStatus {
    pub fn percentage(&self) -> f32 {
        if self.total_bytes == 0 {
            return if self.outcome == TransferOutcome::Success {
                100.0
            } else {
                0.0
            };
        }
        (self.bytes_transferred as f32 / self.total_bytes as f32) * 100.0
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TransferOutcome::Success
    }
}

/// Write side of a transfer's status
pub struct TransferTracker {
    endpoint_id: EndpointId,
    status: watch::Sender<TransferStatus>,
    emitter: Emitter,
}

impl TransferTracker {
    pub(crate) fn new(
        endpoint_id: EndpointId,
        payload_id: PayloadId,
        direction: TransferDirection,
        total_bytes: u64,
        emitter: Emitter,
    ) -> (Self, TransferHandle) {
        let initial = TransferStatus {
            payload_id,
            direction,
            bytes_transferred: 0,
            total_bytes,
            outcome: TransferOutcome::InProgress,
        };
        let (status, rx) = watch::channel(initial.clone());
        emitter.emit(SessionEvent::TransferUpdate {
            endpoint_id: endpoint_id.clone(),
            status: initial,
        });
        let handle = TransferHandle {
            endpoint_id: endpoint_id.clone(),
            payload_id,
            rx,
        };
        (
            TransferTracker {
                endpoint_id,
                status,
                emitter,
            },
            handle,
        )
    }

    pub fn payload_id(&self) -> PayloadId {
        self.status.borrow().payload_id
    }

    pub fn direction(&self) -> TransferDirection {
        self.status.borrow().direction
    }

    pub fn status(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.borrow().outcome.is_terminal()
    }

    /// Report progress; ignored once terminal or if it would go backwards
    pub(crate) fn progress(&self, bytes_transferred: u64) -> bool {
        self.update(|s| {
            if bytes_transferred <= s.bytes_transferred {
                return false;
            }
            s.bytes_transferred = bytes_transferred.min(s.total_bytes);
            true
        })
    }

    pub(crate) fn succeed(&self) -> bool {
        self.update(|s| {
            s.bytes_transferred = s.total_bytes;
            s.outcome = TransferOutcome::Success;
            true
        })
    }

    pub(crate) fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.update(move |s| {
            s.outcome = TransferOutcome::Failure(reason);
            true
        })
    }

    fn update<F>(&self, apply: F) -> bool
    where
        F: FnOnce(&mut TransferStatus) -> bool,
    {
        // Events are emitted under the watch lock so their order matches the
        // order of updates.
        self.status.send_if_modified(|s| {
            if s.outcome.is_terminal() || !apply(s) {
                return false;
            }
            self.emitter.emit(SessionEvent::TransferUpdate {
                endpoint_id: self.endpoint_id.clone(),
                status: s.clone(),
            });
            true
        })
    }
}

impl Drop for TransferTracker {
    fn drop(&mut self) {
        if !self.is_terminal() {
            tracing::warn!(
                "Transfer {} to/from {} dropped while in flight",
                self.payload_id(),
                self.endpoint_id
            );
            self.fail("transfer abandoned");
        }
    }
}

/// Read side of a transfer's status, returned by the send operations
#[derive(Debug, Clone)]
pub struct TransferHandle {
    endpoint_id: EndpointId,
    payload_id: PayloadId,
    rx: watch::Receiver<TransferStatus>,
}

impl TransferHandle {
    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    pub fn payload_id(&self) -> PayloadId {
        self.payload_id
    }

    /// Latest status, without waiting
    pub fn status(&self) -> TransferStatus {
        self.rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().outcome.is_terminal()
    }

    /// Wait until the transfer reaches SUCCESS or FAILURE
    pub async fn finished(&self) -> TransferStatus {
        let mut rx = self.rx.clone();
        let result = rx
            .wait_for(|s| s.outcome.is_terminal())
            .await
            .map(|s| s.clone());
        result.unwrap_or_else(|_| rx.borrow().clone())
    }
}
