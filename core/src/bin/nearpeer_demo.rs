//! NearPeer demo: a host and a guest session on one in-process medium.
//!
//! Usage: nearpeer-demo [CONFIG_JSON] [FILE]
//!
//! The guest discovers the advertising host, both sides accept the
//! connection, the guest sends "hello" (and FILE, if given), a JSON
//! snapshot of the guest's endpoints is printed, then both event logs.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use nearpeer_core::checksum::{file_digest, to_hex};
use nearpeer_core::{
    init, ConnectionResult, LocalMedium, ReceivedPayload, Session, SessionConfig, SessionEvent,
};

const SERVICE_ID: &str = "com.nearpeer.demo";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_for<T, F>(
    events: &mut UnboundedReceiver<SessionEvent>,
    what: &str,
    mut pick: F,
) -> Result<T>
where
    F: FnMut(SessionEvent) -> Option<T>,
{
    timeout(STEP_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if let Some(value) = pick(event) {
                return Some(value);
            }
        }
        None
    })
    .await
    .with_context(|| format!("timed out waiting for {}", what))?
    .with_context(|| format!("event stream closed while waiting for {}", what))
}

fn is_connected(event: SessionEvent) -> Option<()> {
    matches!(
        event,
        SessionEvent::ConnectionResult {
            result: ConnectionResult::Ok,
            ..
        }
    )
    .then_some(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("nearpeer.json"));
    let file = args.next().map(PathBuf::from);

    let config = SessionConfig::load(&config_path)
        .with_context(|| format!("loading config from {:?}", config_path))?;
    let medium = LocalMedium::new();

    let host_config = SessionConfig {
        local_name: format!("{}-host", config.local_name),
        ..config.clone()
    };
    let guest_config = SessionConfig {
        local_name: format!("{}-guest", config.local_name),
        ..config
    };
    let (host, mut host_events) = Session::new(host_config, medium.clone())?;
    let (guest, mut guest_events) = Session::new(guest_config, medium)?;

    host.start_advertising(&host.config().local_name, SERVICE_ID)?;
    guest.start_discovery(SERVICE_ID)?;

    let host_id = wait_for(&mut guest_events, "discovery", |event| match event {
        SessionEvent::EndpointFound { endpoint_id, .. } => Some(endpoint_id),
        _ => None,
    })
    .await?;
    guest.request_connection(&host_id)?;
    guest.accept_connection(&host_id)?;

    let guest_id = wait_for(&mut host_events, "connection request", |event| match event {
        SessionEvent::ConnectionInitiated {
            endpoint_id,
            incoming: true,
            ..
        } => Some(endpoint_id),
        _ => None,
    })
    .await?;
    host.accept_connection(&guest_id)?;

    wait_for(&mut host_events, "host connection", is_connected).await?;
    wait_for(&mut guest_events, "guest connection", is_connected).await?;

    let status = guest.send_bytes(&host_id, "hello")?.finished().await;
    if !status.is_success() {
        bail!("message transfer failed: {:?}", status.outcome);
    }
    let text = wait_for(&mut host_events, "message", |event| match event {
        SessionEvent::PayloadReceived {
            payload: ReceivedPayload::Text(text),
            ..
        } => Some(text),
        _ => None,
    })
    .await?;
    println!("host received: {}", text);
    println!("hello transfer: {}", serde_json::to_string(&status)?);

    if let Some(path) = file {
        let size = std::fs::metadata(&path)
            .with_context(|| format!("reading {:?}", path))?
            .len();
        let status = guest.send_file(&host_id, &path, size)?.finished().await;
        if !status.is_success() {
            bail!("file transfer failed: {:?}", status.outcome);
        }
        let received = wait_for(&mut host_events, "file", |event| match event {
            SessionEvent::PayloadReceived {
                payload: ReceivedPayload::File(file),
                ..
            } => Some(file),
            _ => None,
        })
        .await?;

        let sent = to_hex(&file_digest(&path)?);
        let got = to_hex(&file_digest(received.path())?);
        println!(
            "file {:?} -> {:?} ({} bytes), md5 {} / {}",
            path,
            received.path(),
            received.size,
            sent,
            got
        );
        let _ = std::fs::remove_file(received.path());
        if sent != got {
            bail!("file checksum mismatch");
        }
    }

    println!(
        "guest endpoints: {}",
        serde_json::to_string_pretty(&guest.endpoints())?
    );

    guest.stop_all();
    host.stop_all();

    for (label, session) in [("host", &host), ("guest", &guest)] {
        println!("--- {} log ({}) ---", label, session.local_endpoint_id());
        for entry in session.event_log().snapshot() {
            println!("{}", entry);
        }
    }
    Ok(())
}
