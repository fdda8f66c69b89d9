//! Session
//!
//! Public facade over the registry, event log and payload transfers. Each
//! session is a station on a [`LocalMedium`]; one driver task consumes the
//! station's deliveries in order, so inbound mutations are serialized.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::endpoint::{Endpoint, EndpointId, EndpointState};
use crate::error::{Error, Result};
use crate::event::{ConnectionResult, Emitter, SessionEvent};
use crate::event_log::EventLog;
use crate::medium::{Delivery, LocalMedium, MediumError};
use crate::payload::{Payload, PayloadId, PayloadKind, ReceivedPayload};
use crate::protocol::Frame;
use crate::registry::{Discovered, SessionRegistry, Teardown};
use crate::transfer::incoming::IncomingTransfer;
use crate::transfer::outgoing::{OutgoingTransfer, Source};
use crate::transfer::{TransferDirection, TransferHandle, TransferTracker};

struct Advertisement {
    name: String,
    service_id: String,
}

#[derive(Default)]
struct Radio {
    advertising: Option<Advertisement>,
    discovering: Option<String>,
}

enum Control {
    /// Drop inbound reassembly state of transfers that already ended
    Reap,
}

struct Inner {
    id: EndpointId,
    medium: LocalMedium,
    config: SessionConfig,
    registry: Mutex<SessionRegistry>,
    radio: Mutex<Radio>,
    log: Arc<EventLog>,
    emitter: Emitter,
    control: mpsc::UnboundedSender<Control>,
}

/// A peer session attached to a medium.
///
/// Dropping the session detaches it; connected peers observe link loss.
pub struct Session {
    inner: Arc<Inner>,
    driver: JoinHandle<()>,
}

impl Session {
    /// Attach a new session to `medium`.
    ///
    /// Must be called from within a Tokio runtime. Events are delivered on the
    /// returned receiver; they are also recorded in [`Session::event_log`].
    pub fn new(
        config: SessionConfig,
        medium: LocalMedium,
    ) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;

        let (id, deliveries) = medium.attach();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let log = Arc::new(EventLog::new(config.event_log_capacity));

        tracing::info!("Session {} attached as {}", id, config.local_name);

        let inner = Arc::new(Inner {
            id,
            medium,
            config,
            registry: Mutex::new(SessionRegistry::new()),
            radio: Mutex::new(Radio::default()),
            emitter: Emitter::new(events_tx, log.clone()),
            log,
            control: control_tx,
        });

        let driver = Driver {
            inner: inner.clone(),
            incoming: HashMap::new(),
        };
        let driver = tokio::spawn(driver.run(deliveries, control_rx));

        Ok((Session { inner, driver }, events_rx))
    }

    pub fn local_endpoint_id(&self) -> &EndpointId {
        &self.inner.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn event_log(&self) -> &EventLog {
        &self.inner.log
    }

    pub fn endpoint(&self, endpoint_id: &EndpointId) -> Result<Endpoint> {
        self.inner.registry().get(endpoint_id).cloned()
    }

    /// Every known endpoint, ordered by id
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.registry().snapshot()
    }

    pub fn connected_endpoints(&self) -> Vec<EndpointId> {
        self.inner.registry().connected()
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.radio().advertising.is_some()
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.radio().discovering.is_some()
    }

    /// Announce this session under `service_id`
    pub fn start_advertising(&self, local_name: &str, service_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.emitter.note("Starting advertising...");

        let mut radio = inner.radio();
        match inner.medium.advertise(&inner.id, service_id, local_name) {
            Ok(()) => {
                radio.advertising = Some(Advertisement {
                    name: local_name.to_string(),
                    service_id: service_id.to_string(),
                });
                inner
                    .emitter
                    .note("Advertising started, waiting for connection...");
                Ok(())
            }
            Err(e) => {
                inner.emitter.note(format!("Advertise failed: {}", e));
                Err(Error::Advertise(e.to_string()))
            }
        }
    }

    /// Scan for peers advertising `service_id`
    pub fn start_discovery(&self, service_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.emitter.note("Starting discovery...");

        // Held across `discover` so the driver cannot see the initial
        // reports before the scan is recorded.
        let mut radio = inner.radio();
        match inner.medium.discover(&inner.id, service_id) {
            Ok(()) => {
                radio.discovering = Some(service_id.to_string());
                inner.emitter.note("Discovery started");
                Ok(())
            }
            Err(e) => {
                inner.emitter.note(format!("Discovery failed: {}", e));
                Err(Error::Discovery(e.to_string()))
            }
        }
    }

    pub fn stop_advertising(&self) {
        let inner = &self.inner;
        let taken = inner.radio().advertising.take();
        if let Some(ad) = taken {
            inner.medium.stop_advertising(&inner.id);
            tracing::info!("Stopped advertising {} as {}", ad.service_id, ad.name);
            inner.emitter.note("Advertising stopped");
        }
    }

    /// Stop scanning. Known endpoints are kept but no longer count as visible.
    pub fn stop_discovery(&self) {
        let inner = &self.inner;
        if inner.radio().discovering.take().is_some() {
            inner.medium.stop_discovery(&inner.id);
            inner.registry().clear_visibility();
            inner.emitter.note("Discovery stopped");
        }
    }

    /// Ask a DISCOVERED endpoint for a connection
    pub fn request_connection(&self, endpoint_id: &EndpointId) -> Result<()> {
        let inner = &self.inner;
        let name = inner.announced_name();

        let mut registry = inner.registry();
        inner.logged(registry.check_outgoing(endpoint_id).map(|_| ()))?;

        if let Err(source) = inner.send_frame(endpoint_id, &Frame::ConnectRequest { name }) {
            inner.emitter.note(format!("Request failed: {}", source));
            return Err(Error::Connect {
                endpoint_id: endpoint_id.clone(),
                source,
            });
        }

        let peer = registry.begin_outgoing(endpoint_id)?.name.clone();
        inner.emitter.emit(SessionEvent::ConnectionInitiated {
            endpoint_id: endpoint_id.clone(),
            name: peer,
            incoming: false,
        });
        inner.emitter.note("Connection request sent");
        Ok(())
    }

    /// Accept a PENDING connection; it completes once the peer accepts too
    pub fn accept_connection(&self, endpoint_id: &EndpointId) -> Result<()> {
        let inner = &self.inner;
        let mut registry = inner.registry();
        let mutual = inner.logged(registry.accept_local(endpoint_id))?;

        if let Err(source) =
            inner.send_frame(endpoint_id, &Frame::ConnectResponse { accepted: true })
        {
            inner.close_endpoint(
                &mut registry,
                endpoint_id,
                "accept",
                &source.to_string(),
                None,
            )?;
            return Err(Error::Connect {
                endpoint_id: endpoint_id.clone(),
                source,
            });
        }

        if mutual {
            inner.complete_connection(&mut registry, endpoint_id)?;
        }
        Ok(())
    }

    /// Decline a PENDING connection
    pub fn reject_connection(&self, endpoint_id: &EndpointId) -> Result<()> {
        let inner = &self.inner;
        let mut registry = inner.registry();
        inner.logged(
            registry
                .get(endpoint_id)
                .and_then(|e| e.require_pending("reject")),
        )?;

        // Best effort; the local side is torn down regardless.
        let _ = inner.send_frame(endpoint_id, &Frame::ConnectResponse { accepted: false });
        inner.close_endpoint(
            &mut registry,
            endpoint_id,
            "reject",
            "rejected",
            Some(ConnectionResult::Rejected),
        )?;
        Ok(())
    }

    /// Close a PENDING or CONNECTED endpoint
    pub fn disconnect(&self, endpoint_id: &EndpointId) -> Result<()> {
        let inner = &self.inner;
        let mut registry = inner.registry();
        inner.logged(inner.close_endpoint(
            &mut registry,
            endpoint_id,
            "disconnect",
            "disconnected",
            None,
        ))?;
        let _ = inner.send_frame(endpoint_id, &Frame::Disconnect);
        Ok(())
    }

    /// Send an in-memory payload to a CONNECTED endpoint
    pub fn send_bytes(
        &self,
        endpoint_id: &EndpointId,
        content: impl Into<Bytes>,
    ) -> Result<TransferHandle> {
        self.start_transfer(endpoint_id, Payload::Bytes(content.into()))
    }

    /// Send `size` bytes of the file at `path` to a CONNECTED endpoint
    pub fn send_file(
        &self,
        endpoint_id: &EndpointId,
        path: impl AsRef<Path>,
        size: u64,
    ) -> Result<TransferHandle> {
        self.start_transfer(
            endpoint_id,
            Payload::File {
                path: path.as_ref().to_path_buf(),
                size,
            },
        )
    }

    fn start_transfer(&self, endpoint_id: &EndpointId, payload: Payload) -> Result<TransferHandle> {
        let inner = &self.inner;
        let mut registry = inner.registry();
        let connection = inner.logged(registry.connection_mut(endpoint_id))?;

        let source = match &payload {
            Payload::Bytes(bytes) => Source::Memory(bytes.clone()),
            Payload::File { path, .. } => {
                inner.logged(Source::open(&payload).map_err(|source| Error::UnreadableStream {
                    path: path.clone(),
                    source,
                }))?
            }
        };

        let payload_id = PayloadId::random();
        let (tracker, handle) = TransferTracker::new(
            endpoint_id.clone(),
            payload_id,
            TransferDirection::Outgoing,
            payload.total_size(),
            inner.emitter.clone(),
        );
        let tracker = Arc::new(tracker);
        connection.track(tracker.clone());
        drop(registry);

        let transfer = OutgoingTransfer {
            local_id: inner.id.clone(),
            remote_id: endpoint_id.clone(),
            medium: inner.medium.clone(),
            tracker,
            kind: payload.kind(),
            source,
            total_bytes: payload.total_size(),
            chunk_size: inner.config.chunk_size,
        };
        tokio::spawn(transfer.run());

        Ok(handle)
    }

    /// Cancel an in-flight transfer in either direction; the peer fails it too
    pub fn cancel_payload(&self, payload_id: PayloadId) -> Result<()> {
        let inner = &self.inner;
        let (endpoint_id, tracker) = inner.logged(
            inner
                .registry()
                .find_transfer(payload_id)
                .ok_or(Error::UnknownPayload(payload_id)),
        )?;

        tracker.fail("cancelled");
        let _ = inner.send_frame(&endpoint_id, &Frame::PayloadCancel { payload_id });
        if tracker.direction() == TransferDirection::Incoming {
            let _ = inner.control.send(Control::Reap);
        }
        Ok(())
    }

    /// Stop advertising and discovery and disconnect every peer. Idempotent.
    pub fn stop_all(&self) {
        let inner = &self.inner;
        self.stop_advertising();
        self.stop_discovery();

        let mut registry = inner.registry();
        for endpoint_id in registry.active() {
            let _ = inner.send_frame(&endpoint_id, &Frame::Disconnect);
            if let Err(e) =
                inner.close_endpoint(&mut registry, &endpoint_id, "stop", "session stopped", None)
            {
                tracing::warn!("Stopping {}: {}", endpoint_id, e);
            }
        }
        inner.emitter.note("Stopped all");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
        self.inner.medium.detach(&self.inner.id);
        tracing::info!("Session {} detached", self.inner.id);
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn radio(&self) -> MutexGuard<'_, Radio> {
        self.radio
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Name sent with connection requests
    fn announced_name(&self) -> String {
        self.radio()
            .advertising
            .as_ref()
            .map(|ad| ad.name.clone())
            .unwrap_or_else(|| self.config.local_name.clone())
    }

    fn send_frame(&self, to: &EndpointId, frame: &Frame) -> std::result::Result<(), MediumError> {
        self.medium.send(&self.id, to, frame.encode())
    }

    /// Record a failed operation in the event log
    fn logged<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::warn!("{}", e);
            self.emitter.note(format!("Error: {}", e));
        }
        result
    }

    fn complete_connection(
        &self,
        registry: &mut SessionRegistry,
        endpoint_id: &EndpointId,
    ) -> Result<()> {
        registry.on_connected(endpoint_id)?;
        tracing::info!("Session {} connected to {}", self.id, endpoint_id);
        self.emitter.emit(SessionEvent::ConnectionResult {
            endpoint_id: endpoint_id.clone(),
            result: ConnectionResult::Ok,
        });
        Ok(())
    }

    /// Move an endpoint to DISCONNECTED and report it. A PENDING endpoint
    /// reports `pending_result`, or an error carrying `reason`.
    fn close_endpoint(
        &self,
        registry: &mut SessionRegistry,
        endpoint_id: &EndpointId,
        operation: &'static str,
        reason: &str,
        pending_result: Option<ConnectionResult>,
    ) -> Result<Teardown> {
        let teardown = registry.on_disconnected(endpoint_id, operation, reason)?;

        if teardown.from == EndpointState::Pending {
            self.emitter.emit(SessionEvent::ConnectionResult {
                endpoint_id: endpoint_id.clone(),
                result: pending_result.unwrap_or_else(|| ConnectionResult::Error(reason.into())),
            });
        } else {
            self.emitter.emit(SessionEvent::Disconnected {
                endpoint_id: endpoint_id.clone(),
            });
        }

        if teardown.failed_transfers > 0 {
            self.emitter.note(format!(
                "{} transfer(s) with {} failed: {}",
                teardown.failed_transfers, endpoint_id, reason
            ));
            let _ = self.control.send(Control::Reap);
        }

        if teardown.recycled {
            let name = registry.get(endpoint_id)?.name.clone();
            let service_id = self.radio().discovering.clone().unwrap_or_default();
            self.emitter.emit(SessionEvent::EndpointFound {
                endpoint_id: endpoint_id.clone(),
                name,
                service_id,
            });
        }
        Ok(teardown)
    }

    fn on_found(&self, endpoint_id: EndpointId, name: String, service_id: String) {
        if self.radio().discovering.as_deref() != Some(service_id.as_str()) {
            tracing::debug!("Ignoring {} for inactive scan of {}", endpoint_id, service_id);
            return;
        }
        let mut registry = self.registry();
        match registry.on_discovered(&endpoint_id, &name) {
            Discovered::New | Discovered::Recycled => {
                self.emitter.emit(SessionEvent::EndpointFound {
                    endpoint_id,
                    name,
                    service_id,
                });
            }
            Discovered::Known(state) => {
                tracing::debug!("Endpoint {} seen again while {}", endpoint_id, state);
            }
        }
    }

    fn on_lost(&self, endpoint_id: EndpointId) {
        if self.registry().on_lost(&endpoint_id).is_some() {
            self.emitter.emit(SessionEvent::EndpointLost { endpoint_id });
        }
    }

    /// Tear down a negotiating or connected endpoint after a fault or a peer request
    fn on_peer_gone(&self, endpoint_id: &EndpointId, reason: &str) {
        let mut registry = self.registry();
        match registry.state(endpoint_id) {
            Ok(EndpointState::Pending) | Ok(EndpointState::Connected) => {
                if let Err(e) =
                    self.close_endpoint(&mut registry, endpoint_id, "drop", reason, None)
                {
                    tracing::warn!("Closing {}: {}", endpoint_id, e);
                }
            }
            _ => tracing::debug!("{} from {} ignored", reason, endpoint_id),
        }
    }

    fn on_connect_request(&self, from: &EndpointId, name: String) {
        let mut registry = self.registry();
        match registry.on_connection_request(from, &name) {
            Ok(_) => self.emitter.emit(SessionEvent::ConnectionInitiated {
                endpoint_id: from.clone(),
                name,
                incoming: true,
            }),
            Err(e) => {
                tracing::warn!("Ignoring connection request from {}: {}", from, e);
                self.emitter
                    .note(format!("Ignored connection request from {}: {}", from, e));
            }
        }
    }

    fn on_connect_response(&self, from: &EndpointId, accepted: bool) {
        let mut registry = self.registry();
        if !accepted {
            if let Ok(EndpointState::Pending) = registry.state(from) {
                let closed = self.close_endpoint(
                    &mut registry,
                    from,
                    "record rejection from",
                    "rejected by peer",
                    Some(ConnectionResult::Rejected),
                );
                if let Err(e) = closed {
                    tracing::warn!("Closing {}: {}", from, e);
                }
            }
            return;
        }

        match registry.accept_remote(from) {
            Ok(true) => {
                if let Err(e) = self.complete_connection(&mut registry, from) {
                    tracing::warn!("Completing connection to {}: {}", from, e);
                }
            }
            Ok(false) => tracing::debug!("{} accepted, waiting for local accept", from),
            Err(e) => tracing::warn!("Unexpected accept from {}: {}", from, e),
        }
    }

    /// Register an inbound transfer on the connection to `from`
    fn track_incoming(
        &self,
        from: &EndpointId,
        payload_id: PayloadId,
        total_size: u64,
    ) -> Result<Arc<TransferTracker>> {
        let mut registry = self.registry();
        let connection = registry.connection_mut(from)?;
        let (tracker, _handle) = TransferTracker::new(
            from.clone(),
            payload_id,
            TransferDirection::Incoming,
            total_size,
            self.emitter.clone(),
        );
        let tracker = Arc::new(tracker);
        connection.track(tracker.clone());
        Ok(tracker)
    }

    fn outgoing_tracker(
        &self,
        from: &EndpointId,
        payload_id: PayloadId,
    ) -> Option<Arc<TransferTracker>> {
        self.registry()
            .connection(from)
            .ok()
            .and_then(|c| c.transfer(payload_id))
            .filter(|t| t.direction() == TransferDirection::Outgoing)
            .cloned()
    }
}

/// Consumes medium deliveries for one session
struct Driver {
    inner: Arc<Inner>,
    incoming: HashMap<(EndpointId, PayloadId), IncomingTransfer>,
}

impl Driver {
    async fn run(
        mut self,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.on_delivery(delivery).await,
                    None => break,
                },
                Some(command) = control.recv() => match command {
                    Control::Reap => self.reap().await,
                },
            }
        }
        tracing::debug!("Session {} driver stopped", self.inner.id);
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Found {
                endpoint_id,
                name,
                service_id,
            } => self.inner.on_found(endpoint_id, name, service_id),
            Delivery::Lost { endpoint_id } => self.inner.on_lost(endpoint_id),
            Delivery::LinkDown { endpoint_id } => {
                self.inner.on_peer_gone(&endpoint_id, "link lost")
            }
            Delivery::Frame { from, data } => match Frame::decode(data) {
                Ok(frame) => self.on_frame(from, frame).await,
                Err(e) => {
                    tracing::warn!("Malformed frame from {}: {}", from, e);
                    self.inner
                        .emitter
                        .note(format!("Dropped malformed frame from {}: {}", from, e));
                }
            },
        }
    }

    async fn on_frame(&mut self, from: EndpointId, frame: Frame) {
        tracing::trace!("Frame from {}: {:?}", from, frame);
        match frame {
            Frame::ConnectRequest { name } => self.inner.on_connect_request(&from, name),
            Frame::ConnectResponse { accepted } => self.inner.on_connect_response(&from, accepted),
            Frame::Disconnect => self.inner.on_peer_gone(&from, "disconnected by peer"),
            Frame::PayloadHeader {
                payload_id,
                kind,
                total_size,
            } => self.on_payload_header(from, payload_id, kind, total_size).await,
            Frame::PayloadChunk {
                payload_id,
                offset,
                digest,
                data,
            } => {
                let key = (from, payload_id);
                let Some(transfer) = self.incoming.get_mut(&key) else {
                    tracing::trace!("Chunk for unknown payload {}", payload_id);
                    return;
                };
                if transfer.tracker.is_terminal() {
                    if let Some(transfer) = self.incoming.remove(&key) {
                        transfer.discard().await;
                    }
                    return;
                }
                let written = transfer.write_chunk(offset, &digest, &data).await;
                if let Err(e) = written {
                    if let Some(transfer) = self.incoming.remove(&key) {
                        self.abort_incoming(&key.0, transfer, e.to_string()).await;
                    }
                }
            }
            Frame::PayloadEnd { payload_id, digest } => {
                let Some(transfer) = self.incoming.remove(&(from.clone(), payload_id)) else {
                    return;
                };
                if transfer.tracker.is_terminal() {
                    transfer.discard().await;
                    return;
                }
                let tracker = transfer.tracker.clone();
                match transfer.finish(&digest).await {
                    Ok(payload) if !tracker.is_terminal() => {
                        self.inner.emitter.emit(SessionEvent::PayloadReceived {
                            endpoint_id: from.clone(),
                            payload_id,
                            payload,
                        });
                        tracker.succeed();
                        let _ = self
                            .inner
                            .send_frame(&from, &Frame::PayloadAck { payload_id, ok: true });
                    }
                    Ok(payload) => {
                        tracing::debug!("Payload {} completed after it was failed", payload_id);
                        if let ReceivedPayload::File(file) = payload {
                            let _ = tokio::fs::remove_file(file.path()).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Payload {} from {}: {}", payload_id, from, e);
                        tracker.fail(e.to_string());
                        let _ = self
                            .inner
                            .send_frame(&from, &Frame::PayloadAck { payload_id, ok: false });
                    }
                }
            }
            Frame::PayloadAck { payload_id, ok } => {
                match self.inner.outgoing_tracker(&from, payload_id) {
                    Some(tracker) if ok => {
                        tracker.succeed();
                    }
                    Some(tracker) => {
                        tracker.fail("receiver rejected payload");
                    }
                    None => tracing::debug!("Ack for unknown payload {}", payload_id),
                }
            }
            Frame::PayloadCancel { payload_id } => {
                if let Some(transfer) = self.incoming.remove(&(from.clone(), payload_id)) {
                    transfer.tracker.fail("cancelled by peer");
                    transfer.discard().await;
                } else if let Some(tracker) = self.inner.outgoing_tracker(&from, payload_id) {
                    tracker.fail("cancelled by peer");
                }
            }
        }
    }

    async fn on_payload_header(
        &mut self,
        from: EndpointId,
        payload_id: PayloadId,
        kind: PayloadKind,
        total_size: u64,
    ) {
        let tracker = match self.inner.track_incoming(&from, payload_id, total_size) {
            Ok(tracker) => tracker,
            Err(e) => {
                tracing::warn!("Refusing payload {} from {}: {}", payload_id, from, e);
                let _ = self
                    .inner
                    .send_frame(&from, &Frame::PayloadCancel { payload_id });
                return;
            }
        };

        match IncomingTransfer::create(
            tracker.clone(),
            &from,
            kind,
            total_size,
            &self.inner.config.spool_dir,
        )
        .await
        {
            Ok(transfer) => {
                self.incoming.insert((from, payload_id), transfer);
            }
            Err(e) => {
                tracing::warn!("Cannot receive payload {} from {}: {}", payload_id, from, e);
                tracker.fail(e.to_string());
                let _ = self
                    .inner
                    .send_frame(&from, &Frame::PayloadCancel { payload_id });
            }
        }
    }

    async fn abort_incoming(&self, from: &EndpointId, transfer: IncomingTransfer, reason: String) {
        let payload_id = transfer.tracker.payload_id();
        tracing::warn!(
            "Payload {} from {} aborted at {} bytes: {}",
            payload_id,
            from,
            transfer.received(),
            reason
        );
        transfer.tracker.fail(reason);
        let _ = self
            .inner
            .send_frame(from, &Frame::PayloadCancel { payload_id });
        transfer.discard().await;
    }

    async fn reap(&mut self) {
        let finished: Vec<_> = self
            .incoming
            .iter()
            .filter(|(_, t)| t.tracker.is_terminal())
            .map(|(key, _)| key.clone())
            .collect();
        for key in finished {
            if let Some(transfer) = self.incoming.remove(&key) {
                transfer.discard().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            local_name: "tester".into(),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let bad = SessionConfig {
            chunk_size: 0,
            ..config()
        };
        assert!(matches!(
            Session::new(bad, LocalMedium::new()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_request_unknown_endpoint() {
        let (session, _events) = Session::new(config(), LocalMedium::new()).unwrap();
        let err = session
            .request_connection(&EndpointId::from("ZZZZ"))
            .unwrap_err();
        assert!(matches!(err, Error::NotDiscovered(_)));
        assert!(session
            .event_log()
            .messages()
            .iter()
            .any(|m| m.contains("has not been discovered")));
    }

    #[tokio::test]
    async fn test_accept_and_reject_unknown_endpoint() {
        let (session, _events) = Session::new(config(), LocalMedium::new()).unwrap();
        let ghost = EndpointId::from("ZZZZ");
        assert!(matches!(
            session.accept_connection(&ghost),
            Err(Error::UnknownEndpoint(_))
        ));
        assert!(matches!(
            session.reject_connection(&ghost),
            Err(Error::UnknownEndpoint(_))
        ));
        assert!(matches!(
            session.disconnect(&ghost),
            Err(Error::UnknownEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let (session, mut events) = Session::new(config(), LocalMedium::new()).unwrap();
        let ghost = EndpointId::from("ZZZZ");
        assert!(matches!(
            session.send_bytes(&ghost, "hello"),
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(
            session.send_file(&ghost, "/nonexistent", 1),
            Err(Error::NotConnected(_))
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_advertising_twice_fails() {
        let (session, _events) = Session::new(config(), LocalMedium::new()).unwrap();
        session.start_advertising("A", "svc").unwrap();
        assert!(session.is_advertising());
        assert!(matches!(
            session.start_advertising("A", "svc"),
            Err(Error::Advertise(_))
        ));
        session.stop_advertising();
        assert!(!session.is_advertising());
        assert_eq!(
            session.event_log().messages()[..2],
            [
                "Starting advertising...".to_string(),
                "Advertising started, waiting for connection...".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_discovery_with_empty_service_fails() {
        let (session, _events) = Session::new(config(), LocalMedium::new()).unwrap();
        assert!(matches!(
            session.start_discovery(""),
            Err(Error::Discovery(_))
        ));
        assert!(!session.is_discovering());
    }

    #[tokio::test]
    async fn test_cancel_unknown_payload() {
        let (session, _events) = Session::new(config(), LocalMedium::new()).unwrap();
        assert!(matches!(
            session.cancel_payload(PayloadId(42)),
            Err(Error::UnknownPayload(PayloadId(42)))
        ));
    }

    #[tokio::test]
    async fn test_drop_detaches_station() {
        let medium = LocalMedium::new();
        let (session, _events) = Session::new(config(), medium.clone()).unwrap();
        let id = session.local_endpoint_id().clone();
        assert!(medium.is_attached(&id));
        drop(session);
        assert!(!medium.is_attached(&id));
    }
}
