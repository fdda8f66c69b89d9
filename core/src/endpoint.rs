//! Endpoint State Management
//!
//! Lifecycle of a remote endpoint: discovered, pending, connected, disconnected.

use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;

use crate::error::{Error, Result};

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ID_LEN: usize = 4;

/// Session-scoped endpoint identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        EndpointId(id.into())
    }

    /// Generate a random four character identifier
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..ID_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        EndpointId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        EndpointId(s.to_string())
    }
}

/// Endpoint state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointState {
    /// Seen by discovery (or by an incoming request), not yet negotiating
    Discovered,
    /// Connection negotiation in progress
    Pending,
    /// Both sides accepted, payloads may flow
    Connected,
    /// Rejected, failed or torn down
    Disconnected,
}

impl EndpointState {
    /// Whether `self -> to` is a legal transition
    pub fn can_transition(self, to: EndpointState) -> bool {
        use EndpointState::*;
        matches!(
            (self, to),
            (Discovered, Pending)
                | (Pending, Connected)
                | (Pending, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected, Discovered)
        )
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointState::Discovered => "DISCOVERED",
            EndpointState::Pending => "PENDING",
            EndpointState::Connected => "CONNECTED",
            EndpointState::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// A remote endpoint as seen by the local session
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub discovered_at: SystemTime,
    state: EndpointState,
    /// We sent the connection request
    initiated_locally: bool,
    local_accepted: bool,
    remote_accepted: bool,
    /// Currently reported by our discovery
    visible: bool,
}

impl Endpoint {
    pub fn discovered(id: EndpointId, name: impl Into<String>, visible: bool) -> Self {
        Endpoint {
            id,
            name: name.into(),
            discovered_at: SystemTime::now(),
            state: EndpointState::Discovered,
            initiated_locally: false,
            local_accepted: false,
            remote_accepted: false,
            visible,
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn initiated_locally(&self) -> bool {
        self.initiated_locally
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    fn transition(&mut self, to: EndpointState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidState {
                endpoint_id: self.id.clone(),
                state: self.state,
                operation,
            });
        }
        tracing::debug!("Endpoint {}: {} -> {}", self.id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// DISCOVERED -> PENDING
    pub(crate) fn begin_pending(&mut self, initiated_locally: bool) -> Result<()> {
        let operation = if initiated_locally {
            "request connection to"
        } else {
            "accept a connection request from"
        };
        self.transition(EndpointState::Pending, operation)?;
        self.initiated_locally = initiated_locally;
        self.local_accepted = false;
        self.remote_accepted = false;
        Ok(())
    }

    /// Record our accept; returns true once both sides have accepted
    pub(crate) fn accept_local(&mut self) -> Result<bool> {
        self.require_pending("accept")?;
        if self.local_accepted {
            return Err(Error::InvalidState {
                endpoint_id: self.id.clone(),
                state: self.state,
                operation: "accept twice",
            });
        }
        self.local_accepted = true;
        Ok(self.remote_accepted)
    }

    /// Record the peer's accept; returns true once both sides have accepted
    pub(crate) fn accept_remote(&mut self) -> Result<bool> {
        self.require_pending("record remote accept for")?;
        self.remote_accepted = true;
        Ok(self.local_accepted)
    }

    /// PENDING -> CONNECTED, only after mutual accept
    pub(crate) fn connect(&mut self) -> Result<()> {
        if !(self.local_accepted && self.remote_accepted) {
            return Err(Error::InvalidState {
                endpoint_id: self.id.clone(),
                state: self.state,
                operation: "connect without mutual accept",
            });
        }
        self.transition(EndpointState::Connected, "connect")
    }

    /// PENDING or CONNECTED -> DISCONNECTED
    pub(crate) fn disconnect(&mut self, operation: &'static str) -> Result<EndpointState> {
        let from = self.state;
        self.transition(EndpointState::Disconnected, operation)?;
        self.local_accepted = false;
        self.remote_accepted = false;
        Ok(from)
    }

    /// DISCONNECTED -> DISCOVERED
    pub(crate) fn rediscover(&mut self, name: Option<&str>) -> Result<()> {
        self.transition(EndpointState::Discovered, "rediscover")?;
        if let Some(name) = name {
            self.name = name.to_string();
        }
        self.discovered_at = SystemTime::now();
        self.initiated_locally = false;
        Ok(())
    }

    pub(crate) fn require_pending(&self, operation: &'static str) -> Result<()> {
        if self.state != EndpointState::Pending {
            return Err(Error::InvalidState {
                endpoint_id: self.id.clone(),
                state: self.state,
                operation,
            });
        }
        Ok(())
    }
}
