//! Error types surfaced by the session API.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::endpoint::{EndpointId, EndpointState};
use crate::medium::MediumError;
use crate::payload::PayloadId;

/// Errors returned by [`crate::session::Session`] operations.
///
/// Every variant is recoverable: the session stays usable after any of them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("endpoint {0} has not been discovered")]
    NotDiscovered(EndpointId),
    #[error("cannot {operation} endpoint {endpoint_id} while it is {state}")]
    InvalidState {
        endpoint_id: EndpointId,
        state: EndpointState,
        operation: &'static str,
    },
    #[error("no active connection to endpoint {0}")]
    NotConnected(EndpointId),
    #[error("cannot open {path:?} for reading: {source}")]
    UnreadableStream {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("no transfer in flight for payload {0}")]
    UnknownPayload(PayloadId),
    #[error("advertising failed: {0}")]
    Advertise(String),
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("connection to {endpoint_id} failed: {source}")]
    Connect {
        endpoint_id: EndpointId,
        #[source]
        source: MediumError,
    },
    #[error("send to {endpoint_id} failed: {source}")]
    Send {
        endpoint_id: EndpointId,
        #[source]
        source: MediumError,
    },
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
