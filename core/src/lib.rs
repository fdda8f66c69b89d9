//! NearPeer Core Library
//! Peer discovery, connection negotiation and payload transfer over a shared medium

pub mod checksum;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod event_log;
pub mod medium;
pub mod payload;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transfer;

pub use config::SessionConfig;
pub use endpoint::{Endpoint, EndpointId, EndpointState};
pub use error::{Error, Result};
pub use event::{ConnectionResult, SessionEvent};
pub use event_log::{EventLog, LogEntry};
pub use medium::LocalMedium;
pub use payload::{PayloadId, ReceivedFile, ReceivedPayload};
pub use session::Session;
pub use transfer::{TransferHandle, TransferOutcome, TransferStatus};

/// Initialize the core library (logging)
pub fn init() {
    // Embedders may call this from several entry points; "already set" is a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("NearPeer Core Initialized (logger ready)");
}
