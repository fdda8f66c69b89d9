use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use nearpeer_core::checksum::chunk_digest;
use nearpeer_core::medium::Delivery;
use nearpeer_core::payload::{PayloadKind, MAX_BYTES_PAYLOAD};
use nearpeer_core::protocol::Frame;
use nearpeer_core::transfer::TransferDirection;
use nearpeer_core::{
    ConnectionResult, EndpointId, EndpointState, Error, LocalMedium, PayloadId, ReceivedPayload,
    Session, SessionConfig, SessionEvent, TransferOutcome, TransferStatus,
};

const SERVICE: &str = "com.nearpeer.test";
const WAIT: Duration = Duration::from_secs(5);

fn config(name: &str, spool: &Path) -> SessionConfig {
    SessionConfig {
        local_name: name.to_string(),
        chunk_size: 1024,
        event_log_capacity: 10_000,
        spool_dir: spool.to_path_buf(),
    }
}

async fn next_event<T>(
    events: &mut UnboundedReceiver<SessionEvent>,
    mut pick: impl FnMut(&SessionEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn connection_result(event: &SessionEvent) -> Option<ConnectionResult> {
    match event {
        SessionEvent::ConnectionResult { result, .. } => Some(result.clone()),
        _ => None,
    }
}

/// First in-flight update with some bytes moved in the given direction
fn progressing(direction: TransferDirection) -> impl FnMut(&SessionEvent) -> Option<TransferStatus> {
    move |event: &SessionEvent| match event {
        SessionEvent::TransferUpdate { status, .. }
            if status.direction == direction
                && status.outcome == TransferOutcome::InProgress
                && status.bytes_transferred > 0 =>
        {
            Some(status.clone())
        }
        _ => None,
    }
}

fn terminal(direction: TransferDirection) -> impl FnMut(&SessionEvent) -> Option<TransferStatus> {
    move |event: &SessionEvent| match event {
        SessionEvent::TransferUpdate { status, .. }
            if status.direction == direction && status.outcome.is_terminal() =>
        {
            Some(status.clone())
        }
        _ => None,
    }
}

struct Pair {
    host: Session,
    host_events: UnboundedReceiver<SessionEvent>,
    guest: Session,
    guest_events: UnboundedReceiver<SessionEvent>,
    host_id: EndpointId,
    guest_id: EndpointId,
    spool: TempDir,
}

/// Host advertises "A"; guest discovers it
async fn discovered_pair() -> Pair {
    let spool = tempfile::tempdir().unwrap();
    let medium = LocalMedium::new();
    let (host, host_events) = Session::new(config("host", spool.path()), medium.clone()).unwrap();
    let (guest, mut guest_events) = Session::new(config("guest", spool.path()), medium).unwrap();

    host.start_advertising("A", SERVICE).unwrap();
    guest.start_discovery(SERVICE).unwrap();

    let host_id = next_event(&mut guest_events, |event| match event {
        SessionEvent::EndpointFound {
            endpoint_id, name, ..
        } if name == "A" => Some(endpoint_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(&host_id, host.local_endpoint_id());
    let guest_id = guest.local_endpoint_id().clone();

    Pair {
        host,
        host_events,
        guest,
        guest_events,
        host_id,
        guest_id,
        spool,
    }
}

async fn connected_pair() -> Pair {
    let mut pair = discovered_pair().await;
    pair.guest.request_connection(&pair.host_id).unwrap();

    let requester = next_event(&mut pair.host_events, |event| match event {
        SessionEvent::ConnectionInitiated {
            endpoint_id,
            incoming: true,
            ..
        } => Some(endpoint_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(requester, pair.guest_id);

    pair.host.accept_connection(&pair.guest_id).unwrap();
    pair.guest.accept_connection(&pair.host_id).unwrap();

    assert_eq!(
        next_event(&mut pair.host_events, connection_result).await,
        ConnectionResult::Ok
    );
    assert_eq!(
        next_event(&mut pair.guest_events, connection_result).await,
        ConnectionResult::Ok
    );
    pair
}

/// Bare station on the medium that exchanges frames with a session by hand
struct RawPeer {
    medium: LocalMedium,
    id: EndpointId,
    deliveries: UnboundedReceiver<Delivery>,
}

impl RawPeer {
    fn send(&self, to: &EndpointId, frame: Frame) {
        self.medium.send(&self.id, to, frame.encode()).unwrap();
    }

    async fn next_frame(&mut self) -> Frame {
        timeout(WAIT, async {
            loop {
                match self.deliveries.recv().await.expect("station detached") {
                    Delivery::Frame { data, .. } => return Frame::decode(data).unwrap(),
                    _ => continue,
                }
            }
        })
        .await
        .expect("timed out waiting for frame")
    }
}

/// A session connected to a raw station that it never discovered
async fn raw_connected() -> (Session, UnboundedReceiver<SessionEvent>, RawPeer, TempDir) {
    let spool = tempfile::tempdir().unwrap();
    let medium = LocalMedium::new();
    let (session, mut events) =
        Session::new(config("host", spool.path()), medium.clone()).unwrap();
    let (id, deliveries) = medium.attach();
    let mut peer = RawPeer {
        medium,
        id,
        deliveries,
    };
    let host_id = session.local_endpoint_id().clone();

    peer.send(
        &host_id,
        Frame::ConnectRequest {
            name: "raw".to_string(),
        },
    );
    next_event(&mut events, |event| match event {
        SessionEvent::ConnectionInitiated { incoming: true, .. } => Some(()),
        _ => None,
    })
    .await;
    session.accept_connection(&peer.id).unwrap();
    assert_eq!(
        peer.next_frame().await,
        Frame::ConnectResponse { accepted: true }
    );
    peer.send(&host_id, Frame::ConnectResponse { accepted: true });
    assert_eq!(
        next_event(&mut events, connection_result).await,
        ConnectionResult::Ok
    );
    (session, events, peer, spool)
}

fn spooled_files(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("nearpeer-"))
        })
        .collect()
}

#[tokio::test]
async fn test_connect_scenario() {
    let mut pair = discovered_pair().await;
    let host_id = pair.host_id.clone();

    assert_eq!(
        pair.guest.endpoint(&host_id).unwrap().state(),
        EndpointState::Discovered
    );
    // Both accepts are required; a pending endpoint is not connected.
    assert!(matches!(
        pair.guest.accept_connection(&host_id),
        Err(Error::InvalidState { .. })
    ));

    pair.guest.request_connection(&host_id).unwrap();
    let outgoing = next_event(&mut pair.guest_events, |event| match event {
        SessionEvent::ConnectionInitiated {
            name, incoming, ..
        } => Some((name.clone(), *incoming)),
        _ => None,
    })
    .await;
    assert_eq!(outgoing, ("A".to_string(), false));
    assert_eq!(
        pair.guest.endpoint(&host_id).unwrap().state(),
        EndpointState::Pending
    );
    assert!(matches!(
        pair.guest.request_connection(&host_id),
        Err(Error::InvalidState { .. })
    ));

    let incoming_name = next_event(&mut pair.host_events, |event| match event {
        SessionEvent::ConnectionInitiated {
            name,
            incoming: true,
            ..
        } => Some(name.clone()),
        _ => None,
    })
    .await;
    assert_eq!(incoming_name, "guest");

    pair.guest.accept_connection(&host_id).unwrap();
    assert!(pair.guest.connected_endpoints().is_empty());
    pair.host.accept_connection(&pair.guest_id).unwrap();

    assert_eq!(
        next_event(&mut pair.guest_events, connection_result).await,
        ConnectionResult::Ok
    );
    assert_eq!(
        next_event(&mut pair.host_events, connection_result).await,
        ConnectionResult::Ok
    );
    assert_eq!(pair.guest.connected_endpoints(), vec![host_id.clone()]);
    assert_eq!(pair.host.connected_endpoints(), vec![pair.guest_id.clone()]);
    assert!(pair
        .guest
        .event_log()
        .messages()
        .contains(&format!("Connected: {}", host_id)));
}

#[tokio::test]
async fn test_send_hello() {
    let mut pair = connected_pair().await;
    let handle = pair.guest.send_bytes(&pair.host_id, "hello").unwrap();

    let status = timeout(WAIT, handle.finished()).await.unwrap();
    assert_eq!(status.outcome, TransferOutcome::Success);
    assert_eq!(status.bytes_transferred, 5);

    let (from, text) = next_event(&mut pair.host_events, |event| match event {
        SessionEvent::PayloadReceived {
            endpoint_id,
            payload,
            ..
        } => Some((endpoint_id.clone(), payload.as_text().map(str::to_string))),
        _ => None,
    })
    .await;
    assert_eq!(from, pair.guest_id);
    assert_eq!(text.as_deref(), Some("hello"));
    assert!(pair
        .host
        .event_log()
        .messages()
        .contains(&format!("Msg from {}: hello", pair.guest_id)));
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let mut pair = connected_pair().await;
    let payload = vec![7u8; 10 * 1024 + 17];
    let handle = pair.guest.send_bytes(&pair.host_id, payload).unwrap();
    timeout(WAIT, handle.finished()).await.unwrap();

    let mut updates = Vec::new();
    while let Ok(event) = pair.guest_events.try_recv() {
        if let SessionEvent::TransferUpdate { status, .. } = event {
            if status.payload_id == handle.payload_id() {
                updates.push(status);
            }
        }
    }

    assert!(updates.len() > 2);
    assert!(updates
        .windows(2)
        .all(|w| w[0].bytes_transferred <= w[1].bytes_transferred));
    let terminal: Vec<_> = updates.iter().filter(|s| s.outcome.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(updates.last().unwrap().outcome, TransferOutcome::Success);

    let received = next_event(&mut pair.host_events, |event| match event {
        SessionEvent::PayloadReceived { payload, .. } => Some(payload.clone()),
        _ => None,
    })
    .await;
    match received {
        ReceivedPayload::Bytes(bytes) => assert_eq!(bytes.len(), 10 * 1024 + 17),
        // All sevens is valid UTF-8 as well
        ReceivedPayload::Text(text) => assert_eq!(text.len(), 10 * 1024 + 17),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_send_without_connection_creates_no_transfer() {
    let mut pair = discovered_pair().await;
    assert!(matches!(
        pair.guest.send_bytes(&pair.host_id, "hello"),
        Err(Error::NotConnected(_))
    ));
    assert!(matches!(
        pair.guest.send_file(&pair.host_id, "/no/such/file", 10),
        Err(Error::NotConnected(_))
    ));
    while let Ok(event) = pair.guest_events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::TransferUpdate { .. }),
            "unexpected transfer: {}",
            event
        );
    }
}

#[tokio::test]
async fn test_file_transfer() {
    let mut pair = connected_pair().await;

    let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let mut source = NamedTempFile::new().unwrap();
    source.write_all(&content).unwrap();
    source.flush().unwrap();

    let handle = pair
        .guest
        .send_file(&pair.host_id, source.path(), content.len() as u64)
        .unwrap();
    let status = timeout(WAIT, handle.finished()).await.unwrap();
    assert!(status.is_success());

    let file = next_event(&mut pair.host_events, |event| match event {
        SessionEvent::PayloadReceived {
            payload: ReceivedPayload::File(file),
            ..
        } => Some(file.clone()),
        _ => None,
    })
    .await;
    assert_eq!(file.size, content.len() as u64);
    assert!(file.path().starts_with(pair.spool.path()));
    assert_eq!(std::fs::read(file.path()).unwrap(), content);
}

#[tokio::test]
async fn test_send_unreadable_file() {
    let pair = connected_pair().await;
    let missing = pair.spool.path().join("missing.bin");
    assert!(matches!(
        pair.guest.send_file(&pair.host_id, &missing, 10),
        Err(Error::UnreadableStream { .. })
    ));
    assert!(matches!(
        pair.guest.send_file(&pair.host_id, pair.spool.path(), 10),
        Err(Error::UnreadableStream { .. })
    ));
}

#[tokio::test]
async fn test_stop_all_fails_in_flight_transfer() {
    let mut pair = connected_pair().await;
    let handle = pair
        .guest
        .send_bytes(&pair.host_id, vec![1u8; 2 * 1024 * 1024])
        .unwrap();
    next_event(
        &mut pair.guest_events,
        progressing(TransferDirection::Outgoing),
    )
    .await;

    pair.guest.stop_all();
    pair.guest.stop_all();

    assert_eq!(
        handle.status().outcome,
        TransferOutcome::Failure("session stopped".into())
    );
    assert!(!pair.guest.is_advertising() && !pair.guest.is_discovering());
    assert!(pair.guest.connected_endpoints().is_empty());
    assert!(pair
        .guest
        .endpoints()
        .iter()
        .all(|e| e.state() == EndpointState::Disconnected));

    let incoming = next_event(&mut pair.host_events, terminal(TransferDirection::Incoming)).await;
    assert!(matches!(incoming.outcome, TransferOutcome::Failure(_)));
    next_event(&mut pair.host_events, |event| match event {
        SessionEvent::Disconnected { endpoint_id } => Some(endpoint_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(
        pair.host.endpoint(&pair.guest_id).unwrap().state(),
        EndpointState::Disconnected
    );
}

#[tokio::test]
async fn test_reject_connection() {
    let mut pair = discovered_pair().await;
    pair.guest.request_connection(&pair.host_id).unwrap();
    next_event(&mut pair.host_events, |event| match event {
        SessionEvent::ConnectionInitiated { incoming: true, .. } => Some(()),
        _ => None,
    })
    .await;

    pair.host.reject_connection(&pair.guest_id).unwrap();
    assert_eq!(
        pair.host.endpoint(&pair.guest_id).unwrap().state(),
        EndpointState::Disconnected
    );
    assert_eq!(
        next_event(&mut pair.guest_events, connection_result).await,
        ConnectionResult::Rejected
    );

    // Still visible, so the guest can try again.
    assert_eq!(
        pair.guest.endpoint(&pair.host_id).unwrap().state(),
        EndpointState::Discovered
    );
    assert!(pair.guest.request_connection(&pair.host_id).is_ok());
}

#[tokio::test]
async fn test_disconnect_and_recycle() {
    let mut pair = connected_pair().await;
    pair.guest.disconnect(&pair.host_id).unwrap();

    // The guest still sees the host advertising.
    assert_eq!(
        pair.guest.endpoint(&pair.host_id).unwrap().state(),
        EndpointState::Discovered
    );
    assert!(matches!(
        pair.guest.disconnect(&pair.host_id),
        Err(Error::InvalidState { .. })
    ));

    next_event(&mut pair.host_events, |event| match event {
        SessionEvent::Disconnected { endpoint_id } => Some(endpoint_id.clone()),
        _ => None,
    })
    .await;
    assert!(pair.host.connected_endpoints().is_empty());
    assert!(matches!(
        pair.host.send_bytes(&pair.guest_id, "late"),
        Err(Error::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_peer_drop_is_link_loss() {
    let Pair {
        host,
        guest,
        mut guest_events,
        host_id,
        ..
    } = connected_pair().await;
    drop(host);

    let lost = next_event(&mut guest_events, |event| match event {
        SessionEvent::EndpointLost { endpoint_id } => Some(endpoint_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(lost, host_id);
    next_event(&mut guest_events, |event| match event {
        SessionEvent::Disconnected { .. } => Some(()),
        _ => None,
    })
    .await;

    let endpoint = guest.endpoint(&host_id).unwrap();
    assert_eq!(endpoint.state(), EndpointState::Disconnected);
    assert!(!endpoint.is_visible());
    assert!(matches!(
        guest.send_bytes(&host_id, "anyone?"),
        Err(Error::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_sender_cancels_payload() {
    let mut pair = connected_pair().await;
    let handle = pair
        .guest
        .send_bytes(&pair.host_id, vec![2u8; 2 * 1024 * 1024])
        .unwrap();
    next_event(
        &mut pair.host_events,
        progressing(TransferDirection::Incoming),
    )
    .await;

    pair.guest.cancel_payload(handle.payload_id()).unwrap();
    assert_eq!(
        handle.status().outcome,
        TransferOutcome::Failure("cancelled".into())
    );

    let incoming = next_event(&mut pair.host_events, terminal(TransferDirection::Incoming)).await;
    assert_eq!(incoming.payload_id, handle.payload_id());
    assert_eq!(
        incoming.outcome,
        TransferOutcome::Failure("cancelled by peer".into())
    );

    // The connection survives a cancelled payload.
    let next = pair.guest.send_bytes(&pair.host_id, "after").unwrap();
    assert!(timeout(WAIT, next.finished()).await.unwrap().is_success());
}

#[tokio::test]
async fn test_receiver_cancels_payload() {
    let mut pair = connected_pair().await;
    let handle = pair
        .guest
        .send_bytes(&pair.host_id, vec![3u8; 2 * 1024 * 1024])
        .unwrap();
    let incoming = next_event(
        &mut pair.host_events,
        progressing(TransferDirection::Incoming),
    )
    .await;
    assert_eq!(incoming.payload_id, handle.payload_id());

    pair.host.cancel_payload(incoming.payload_id).unwrap();
    let status = timeout(WAIT, handle.finished()).await.unwrap();
    assert_eq!(
        status.outcome,
        TransferOutcome::Failure("cancelled by peer".into())
    );
    assert!(matches!(
        pair.host.cancel_payload(incoming.payload_id),
        Err(Error::UnknownPayload(_))
    ));
}

#[tokio::test]
async fn test_dropped_receiver_removes_partial_file() {
    let Pair {
        host,
        mut host_events,
        guest,
        host_id,
        spool,
        ..
    } = connected_pair().await;

    let mut source = NamedTempFile::new().unwrap();
    source.write_all(&vec![9u8; 4 * 1024 * 1024]).unwrap();
    source.flush().unwrap();
    let handle = guest
        .send_file(&host_id, source.path(), 4 * 1024 * 1024)
        .unwrap();
    next_event(&mut host_events, progressing(TransferDirection::Incoming)).await;
    assert_eq!(spooled_files(spool.path()).len(), 1);

    drop(host);
    let status = timeout(WAIT, handle.finished()).await.unwrap();
    assert!(matches!(status.outcome, TransferOutcome::Failure(_)));

    // The aborted driver releases its transfers on the runtime's next turn.
    timeout(WAIT, async {
        while !spooled_files(spool.path()).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("partial spool file left behind");
}

#[tokio::test]
async fn test_negative_ack_fails_sender() {
    let (host, _events, mut peer, _spool) = raw_connected().await;
    let handle = host.send_bytes(&peer.id, "hello").unwrap();

    let payload_id = loop {
        match peer.next_frame().await {
            Frame::PayloadEnd { payload_id, .. } => break payload_id,
            Frame::PayloadHeader { kind, total_size, .. } => {
                assert_eq!(kind, PayloadKind::Bytes);
                assert_eq!(total_size, 5);
            }
            _ => {}
        }
    };
    assert_eq!(payload_id, handle.payload_id());
    // Nothing is final until the receiver answers.
    assert!(!handle.is_finished());

    peer.send(
        host.local_endpoint_id(),
        Frame::PayloadAck {
            payload_id,
            ok: false,
        },
    );
    let status = timeout(WAIT, handle.finished()).await.unwrap();
    assert_eq!(
        status.outcome,
        TransferOutcome::Failure("receiver rejected payload".into())
    );
    assert_eq!(host.connected_endpoints(), vec![peer.id.clone()]);
}

#[tokio::test]
async fn test_corrupted_payload_is_nacked() {
    let (host, mut events, mut peer, _spool) = raw_connected().await;
    let host_id = host.local_endpoint_id().clone();
    let payload_id = PayloadId(7);
    let data = bytes::Bytes::from_static(b"hello");

    peer.send(
        &host_id,
        Frame::PayloadHeader {
            payload_id,
            kind: PayloadKind::Bytes,
            total_size: data.len() as u64,
        },
    );
    peer.send(
        &host_id,
        Frame::PayloadChunk {
            payload_id,
            offset: 0,
            digest: chunk_digest(&data),
            data: data.clone(),
        },
    );
    peer.send(
        &host_id,
        Frame::PayloadEnd {
            payload_id,
            digest: chunk_digest(b"jello"),
        },
    );

    assert_eq!(
        peer.next_frame().await,
        Frame::PayloadAck {
            payload_id,
            ok: false
        }
    );
    let incoming = next_event(&mut events, terminal(TransferDirection::Incoming)).await;
    assert_eq!(incoming.payload_id, payload_id);
    match incoming.outcome {
        TransferOutcome::Failure(reason) => {
            assert!(reason.starts_with("payload checksum mismatch"), "{}", reason)
        }
        other => panic!("expected failure, got {:?}", other),
    }
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::PayloadReceived { .. }),
            "corrupted payload delivered"
        );
    }
}

#[tokio::test]
async fn test_oversized_bytes_payload_refused() {
    let (host, mut events, mut peer, _spool) = raw_connected().await;
    let payload_id = PayloadId(8);
    peer.send(
        host.local_endpoint_id(),
        Frame::PayloadHeader {
            payload_id,
            kind: PayloadKind::Bytes,
            total_size: MAX_BYTES_PAYLOAD + 1,
        },
    );

    assert_eq!(peer.next_frame().await, Frame::PayloadCancel { payload_id });
    let incoming = next_event(&mut events, terminal(TransferDirection::Incoming)).await;
    assert_eq!(incoming.payload_id, payload_id);
    assert!(matches!(incoming.outcome, TransferOutcome::Failure(_)));
    assert!(matches!(
        host.cancel_payload(payload_id),
        Err(Error::UnknownPayload(_))
    ));
}
