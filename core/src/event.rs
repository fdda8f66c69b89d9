//! Session events delivered to the caller and mirrored into the event log.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::endpoint::EndpointId;
use crate::event_log::EventLog;
use crate::payload::{PayloadId, ReceivedPayload};
use crate::transfer::{TransferDirection, TransferOutcome, TransferStatus};

/// Outcome of a connection negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionResult {
    Ok,
    Rejected,
    Error(String),
}

/// Callbacks of the session, as a message stream
#[derive(Debug, Clone)]
pub enum SessionEvent {
    EndpointFound {
        endpoint_id: EndpointId,
        name: String,
        service_id: String,
    },
    EndpointLost {
        endpoint_id: EndpointId,
    },
    /// Either side started negotiating; `incoming` is true when the peer asked
    ConnectionInitiated {
        endpoint_id: EndpointId,
        name: String,
        incoming: bool,
    },
    ConnectionResult {
        endpoint_id: EndpointId,
        result: ConnectionResult,
    },
    Disconnected {
        endpoint_id: EndpointId,
    },
    PayloadReceived {
        endpoint_id: EndpointId,
        payload_id: PayloadId,
        payload: ReceivedPayload,
    },
    TransferUpdate {
        endpoint_id: EndpointId,
        status: TransferStatus,
    },
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::EndpointFound {
                endpoint_id, name, ..
            } => write!(f, "Found: {} ({})", name, endpoint_id),
            SessionEvent::EndpointLost { endpoint_id } => {
                write!(f, "Lost endpoint: {}", endpoint_id)
            }
            SessionEvent::ConnectionInitiated {
                name,
                incoming: true,
                ..
            } => write!(f, "Connection initiated from {}", name),
            SessionEvent::ConnectionInitiated {
                name,
                incoming: false,
                ..
            } => write!(f, "Connection initiated to {}", name),
            SessionEvent::ConnectionResult {
                endpoint_id,
                result,
            } => match result {
                ConnectionResult::Ok => write!(f, "Connected: {}", endpoint_id),
                ConnectionResult::Rejected => {
                    write!(f, "Connection rejected: {}", endpoint_id)
                }
                ConnectionResult::Error(reason) => {
                    write!(f, "Connection error with {}: {}", endpoint_id, reason)
                }
            },
            SessionEvent::Disconnected { endpoint_id } => {
                write!(f, "Disconnected: {}", endpoint_id)
            }
            SessionEvent::PayloadReceived {
                endpoint_id,
                payload,
                ..
            } => match payload {
                ReceivedPayload::Text(text) => write!(f, "Msg from {}: {}", endpoint_id, text),
                ReceivedPayload::Bytes(bytes) => {
                    write!(f, "Bytes from {}: {} bytes", endpoint_id, bytes.len())
                }
                ReceivedPayload::File(file) => write!(
                    f,
                    "File payload received from {} ({} bytes at {})",
                    endpoint_id,
                    file.size,
                    file.path.display()
                ),
            },
            SessionEvent::TransferUpdate { status, .. } => {
                let dir = match status.direction {
                    TransferDirection::Outgoing => "Send",
                    TransferDirection::Incoming => "Receive",
                };
                match &status.outcome {
                    TransferOutcome::InProgress => write!(
                        f,
                        "{} {} in progress: {}/{}",
                        dir, status.payload_id, status.bytes_transferred, status.total_bytes
                    ),
                    TransferOutcome::Success => {
                        write!(f, "{} {} success", dir, status.payload_id)
                    }
                    TransferOutcome::Failure(reason) => {
                        write!(f, "{} {} failed: {}", dir, status.payload_id, reason)
                    }
                }
            }
        }
    }
}

/// Fans events out to the caller's channel and the event log
#[derive(Clone)]
pub(crate) struct Emitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
    log: Arc<EventLog>,
}

impl Emitter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>, log: Arc<EventLog>) -> Self {
        Emitter { tx, log }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.log.append(event.to_string());
        // Caller may have dropped the receiver; the log still records it.
        let _ = self.tx.send(event);
    }

    pub(crate) fn note(&self, message: impl Into<String>) {
        self.log.append(message);
    }
}
