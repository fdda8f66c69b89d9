//! Session Registry
//!
//! Keyed map of known endpoints and the connection owned by each connected one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::endpoint::{Endpoint, EndpointId, EndpointState};
use crate::error::{Error, Result};
use crate::payload::PayloadId;
use crate::transfer::{TransferDirection, TransferTracker};

/// Live connection to a CONNECTED endpoint
pub struct Connection {
    pub connected_at: SystemTime,
    transfers: HashMap<PayloadId, Arc<TransferTracker>>,
}

impl Connection {
    fn new() -> Self {
        Connection {
            connected_at: SystemTime::now(),
            transfers: HashMap::new(),
        }
    }

    pub(crate) fn track(&mut self, tracker: Arc<TransferTracker>) {
        self.transfers.retain(|_, t| !t.is_terminal());
        self.transfers.insert(tracker.payload_id(), tracker);
    }

    pub(crate) fn transfer(&self, payload_id: PayloadId) -> Option<&Arc<TransferTracker>> {
        self.transfers.get(&payload_id)
    }

    /// In-flight transfers in the given direction
    pub fn active_transfers(&self, direction: TransferDirection) -> Vec<PayloadId> {
        let mut ids: Vec<PayloadId> = self
            .transfers
            .values()
            .filter(|t| !t.is_terminal() && t.direction() == direction)
            .map(|t| t.payload_id())
            .collect();
        ids.sort();
        ids
    }

    /// Fail every in-flight transfer; returns how many were failed
    fn fail_all(&mut self, reason: &str) -> usize {
        self.transfers
            .drain()
            .filter(|(_, t)| t.fail(reason))
            .count()
    }
}

struct Record {
    endpoint: Endpoint,
    connection: Option<Connection>,
}

/// Result of a discovery notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovered {
    /// First sighting
    New,
    /// A DISCONNECTED endpoint came back as DISCOVERED
    Recycled,
    /// Already tracked in some other state
    Known(EndpointState),
}

/// Result of tearing down an endpoint's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub from: EndpointState,
    pub failed_transfers: usize,
    /// Still visible, so it went straight back to DISCOVERED
    pub recycled: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    records: HashMap<EndpointId, Record>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_discovered(&mut self, id: &EndpointId, name: &str) -> Discovered {
        match self.records.get_mut(id) {
            None => {
                self.records.insert(
                    id.clone(),
                    Record {
                        endpoint: Endpoint::discovered(id.clone(), name, true),
                        connection: None,
                    },
                );
                Discovered::New
            }
            Some(record) => {
                record.endpoint.set_visible(true);
                match record.endpoint.state() {
                    EndpointState::Disconnected => {
                        match record.endpoint.rediscover(Some(name)) {
                            Ok(()) => Discovered::Recycled,
                            Err(_) => Discovered::Known(record.endpoint.state()),
                        }
                    }
                    EndpointState::Discovered => {
                        record.endpoint.name = name.to_string();
                        Discovered::Known(EndpointState::Discovered)
                    }
                    state => Discovered::Known(state),
                }
            }
        }
    }

    /// Returns the state the endpoint was in, or None if unknown.
    /// DISCOVERED and DISCONNECTED entries are removed; negotiating or
    /// connected ones are only marked invisible.
    pub fn on_lost(&mut self, id: &EndpointId) -> Option<EndpointState> {
        let record = self.records.get_mut(id)?;
        let state = record.endpoint.state();
        match state {
            EndpointState::Discovered | EndpointState::Disconnected => {
                self.records.remove(id);
            }
            _ => record.endpoint.set_visible(false),
        }
        Some(state)
    }

    /// Our discovery stopped: nothing is visible any more
    pub fn clear_visibility(&mut self) {
        for record in self.records.values_mut() {
            record.endpoint.set_visible(false);
        }
    }

    /// Local connect request: DISCOVERED -> PENDING
    pub fn begin_outgoing(&mut self, id: &EndpointId) -> Result<&Endpoint> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotDiscovered(id.clone()))?;
        record.endpoint.begin_pending(true)?;
        Ok(&record.endpoint)
    }

    /// Check that a local connect request would be legal
    pub fn check_outgoing(&self, id: &EndpointId) -> Result<&Endpoint> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| Error::NotDiscovered(id.clone()))?;
        if record.endpoint.state() != EndpointState::Discovered {
            return Err(Error::InvalidState {
                endpoint_id: id.clone(),
                state: record.endpoint.state(),
                operation: "request connection to",
            });
        }
        Ok(&record.endpoint)
    }

    /// Remote connect request; unknown peers are registered as DISCOVERED first
    pub fn on_connection_request(&mut self, id: &EndpointId, name: &str) -> Result<&Endpoint> {
        let record = self.records.entry(id.clone()).or_insert_with(|| Record {
            endpoint: Endpoint::discovered(id.clone(), name, false),
            connection: None,
        });
        if record.endpoint.state() == EndpointState::Disconnected {
            record.endpoint.rediscover(Some(name))?;
        }
        record.endpoint.begin_pending(false)?;
        record.endpoint.name = name.to_string();
        Ok(&record.endpoint)
    }

    /// Returns true once both sides accepted
    pub fn accept_local(&mut self, id: &EndpointId) -> Result<bool> {
        self.endpoint_mut(id)?.accept_local()
    }

    /// Returns true once both sides accepted
    pub fn accept_remote(&mut self, id: &EndpointId) -> Result<bool> {
        self.endpoint_mut(id)?.accept_remote()
    }

    /// PENDING -> CONNECTED and create the connection
    pub fn on_connected(&mut self, id: &EndpointId) -> Result<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::UnknownEndpoint(id.clone()))?;
        record.endpoint.connect()?;
        debug_assert!(record.connection.is_none());
        record.connection = Some(Connection::new());
        Ok(())
    }

    /// PENDING/CONNECTED -> DISCONNECTED; destroys the connection and fails its transfers
    pub fn on_disconnected(
        &mut self,
        id: &EndpointId,
        operation: &'static str,
        reason: &str,
    ) -> Result<Teardown> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::UnknownEndpoint(id.clone()))?;
        let from = record.endpoint.disconnect(operation)?;
        let failed_transfers = record
            .connection
            .take()
            .map(|mut c| c.fail_all(reason))
            .unwrap_or(0);
        let recycled = record.endpoint.is_visible() && record.endpoint.rediscover(None).is_ok();
        Ok(Teardown {
            from,
            failed_transfers,
            recycled,
        })
    }

    pub fn get(&self, id: &EndpointId) -> Result<&Endpoint> {
        self.records
            .get(id)
            .map(|r| &r.endpoint)
            .ok_or_else(|| Error::UnknownEndpoint(id.clone()))
    }

    pub fn state(&self, id: &EndpointId) -> Result<EndpointState> {
        self.get(id).map(Endpoint::state)
    }

    fn endpoint_mut(&mut self, id: &EndpointId) -> Result<&mut Endpoint> {
        self.records
            .get_mut(id)
            .map(|r| &mut r.endpoint)
            .ok_or_else(|| Error::UnknownEndpoint(id.clone()))
    }

    pub fn connection(&self, id: &EndpointId) -> Result<&Connection> {
        self.records
            .get(id)
            .and_then(|r| r.connection.as_ref())
            .ok_or_else(|| Error::NotConnected(id.clone()))
    }

    pub fn connection_mut(&mut self, id: &EndpointId) -> Result<&mut Connection> {
        self.records
            .get_mut(id)
            .and_then(|r| r.connection.as_mut())
            .ok_or_else(|| Error::NotConnected(id.clone()))
    }

    /// Locate an in-flight transfer on any connection
    pub(crate) fn find_transfer(
        &self,
        payload_id: PayloadId,
    ) -> Option<(EndpointId, Arc<TransferTracker>)> {
        self.records.iter().find_map(|(id, r)| {
            r.connection
                .as_ref()
                .and_then(|c| c.transfer(payload_id))
                .filter(|t| !t.is_terminal())
                .map(|t| (id.clone(), t.clone()))
        })
    }

    /// All endpoints, ordered by id
    pub fn snapshot(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> =
            self.records.values().map(|r| r.endpoint.clone()).collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        endpoints
    }

    pub fn connected(&self) -> Vec<EndpointId> {
        self.ids_in(&[EndpointState::Connected])
    }

    /// PENDING or CONNECTED endpoints
    pub fn active(&self) -> Vec<EndpointId> {
        self.ids_in(&[EndpointState::Pending, EndpointState::Connected])
    }

    fn ids_in(&self, states: &[EndpointState]) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self
            .records
            .iter()
            .filter(|(_, r)| states.contains(&r.endpoint.state()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
