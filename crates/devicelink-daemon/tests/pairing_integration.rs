//! Integration tests for the pairing manager and trust store.
//!
//! These tests exercise the `PairingManager` through its public API the way
//! the orchestrator uses it, with the trust store on a real (temporary)
//! filesystem and sessions backed by in-memory duplex transports. They
//! verify:
//!
//! - The outgoing flow: request, peer accepts, trust persists; request,
//!   peer rejects, trust does not.
//! - The incoming flow: request surfaces, accept writes the response
//!   packet and the trust file, reject writes the refusal.
//! - Trust persistence across a manager restart (the crash-recovery case).
//! - The packets the manager actually puts on the wire.
//!
//! # What is the pairing flow?
//!
//! Both sides hold self-signed certificates; TLS alone proves key
//! possession, not trust. Trust is established once, by a human comparing
//! an 8-hex-digit verification key derived from both certificates:
//!
//! ```text
//! Desktop                             Phone
//! ───────                             ─────
//! request_pairing(connection)
//!   → verification key shown          verification key shown
//!   pair packet {pair: true}  ─────►  user compares keys, taps accept
//!                             ◄─────  pair packet {pair: true}
//! trust store: <device_id>.pem written; is_paired → true
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

use devicelink_core::protocol::{
    codec, DeviceType, IdentityInfo, NetworkPacket, PACKET_TYPE_PAIR, PROTOCOL_VERSION,
};
use devicelink_daemon::connection::DeviceConnection;
use devicelink_daemon::pairing::{verification_key, PairingEvent, PairingManager};

const PHONE_ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const PHONE_CERT: &str = "-----BEGIN CERTIFICATE-----\nPHONE\n-----END CERTIFICATE-----\n";
const DESKTOP_CERT: &str = "-----BEGIN CERTIFICATE-----\nDESKTOP\n-----END CERTIFICATE-----\n";

/// A duplex-backed session standing in for an established TLS connection.
/// Returns the connection and the far (phone) end of the transport.
fn phone_connection() -> (Arc<DeviceConnection>, DuplexStream) {
    let identity = IdentityInfo {
        device_id: PHONE_ID.to_string(),
        device_name: "integration-phone".to_string(),
        device_type: DeviceType::Phone,
        protocol_version: PROTOCOL_VERSION,
        tcp_port: None,
        incoming_capabilities: vec![],
        outgoing_capabilities: vec![],
    };
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let conn = Arc::new(DeviceConnection::new(
        &identity,
        Some(PHONE_CERT.to_string()),
        Box::new(ours),
        None,
    ));
    (conn, theirs)
}

fn new_manager(dir: &Path) -> (Arc<PairingManager>, mpsc::Receiver<PairingEvent>) {
    PairingManager::new(dir, DESKTOP_CERT.to_string(), Duration::from_secs(30))
        .expect("trust store must open")
}

/// What the phone would send: a `kdeconnect.pair` packet.
fn pair_packet_from_phone(pair: bool) -> NetworkPacket {
    let mut body = Map::new();
    body.insert("pair".to_string(), json!(pair));
    NetworkPacket::new(PACKET_TYPE_PAIR, body)
}

/// Reads one newline-delimited packet off the phone's end of the transport.
async fn read_packet(theirs: &mut DuplexStream) -> NetworkPacket {
    let mut buf = vec![0u8; 64 * 1024];
    let n = tokio::time::timeout(Duration::from_secs(5), theirs.read(&mut buf))
        .await
        .expect("packet within timeout")
        .expect("transport readable");
    let text = String::from_utf8_lossy(&buf[..n]);
    let line = text.lines().next().expect("one line");
    codec::decode(line).expect("valid packet")
}

/// The complete outgoing happy path: request, wire packet, peer accept,
/// persisted trust.
#[tokio::test]
async fn outgoing_pairing_accepted_by_peer_persists_trust() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mut events) = new_manager(dir.path());
    let (conn, mut phone) = phone_connection();

    let key = manager
        .request_pairing(Arc::clone(&conn))
        .await
        .expect("request over live connection");
    assert_eq!(key, verification_key(DESKTOP_CERT, PHONE_CERT));

    // The request must be on the wire as a pair=true packet.
    let sent = read_packet(&mut phone).await;
    assert!(sent.is_type(PACKET_TYPE_PAIR));
    assert_eq!(sent.body_bool("pair"), Some(true));

    // Phone accepts.
    manager
        .handle_pair_packet(&pair_packet_from_phone(true), &conn)
        .await;

    match events.recv().await {
        Some(PairingEvent::Result {
            device_id, success, ..
        }) => {
            assert_eq!(device_id, PHONE_ID);
            assert!(success);
        }
        other => panic!("expected success result, got {other:?}"),
    }

    assert!(manager.is_paired(PHONE_ID));
    let trust_file = dir.path().join(format!("{PHONE_ID}.pem"));
    assert_eq!(
        std::fs::read_to_string(trust_file).unwrap(),
        PHONE_CERT,
        "trust store must hold the peer's certificate verbatim"
    );
}

/// Rejection by the peer leaves no trace in the trust store.
#[tokio::test]
async fn outgoing_pairing_rejected_by_peer_leaves_untrusted() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mut events) = new_manager(dir.path());
    let (conn, mut phone) = phone_connection();

    manager.request_pairing(Arc::clone(&conn)).await.unwrap();
    let _request = read_packet(&mut phone).await;

    manager
        .handle_pair_packet(&pair_packet_from_phone(false), &conn)
        .await;

    match events.recv().await {
        Some(PairingEvent::Result { success, .. }) => assert!(!success),
        other => panic!("expected failure result, got {other:?}"),
    }
    assert!(!manager.is_paired(PHONE_ID));
    assert!(!dir.path().join(format!("{PHONE_ID}.pem")).exists());
}

/// Incoming flow: the phone asks first, we accept, and our acceptance goes
/// out on the wire before the trust file lands.
#[tokio::test]
async fn incoming_pairing_accept_responds_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mut events) = new_manager(dir.path());
    let (conn, mut phone) = phone_connection();

    manager
        .handle_pair_packet(&pair_packet_from_phone(true), &conn)
        .await;

    let request = match events.recv().await {
        Some(PairingEvent::Incoming(request)) => request,
        other => panic!("expected incoming request, got {other:?}"),
    };
    assert_eq!(request.device_id, PHONE_ID);
    assert_eq!(
        request.verification_key,
        verification_key(DESKTOP_CERT, PHONE_CERT),
        "both sides must derive the same key"
    );

    manager.accept(PHONE_ID).await.unwrap();

    let response = read_packet(&mut phone).await;
    assert_eq!(response.body_bool("pair"), Some(true));
    assert!(manager.is_paired(PHONE_ID));
}

/// Incoming flow, rejected: the refusal goes out and nothing persists.
#[tokio::test]
async fn incoming_pairing_reject_responds_with_refusal() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, mut events) = new_manager(dir.path());
    let (conn, mut phone) = phone_connection();

    manager
        .handle_pair_packet(&pair_packet_from_phone(true), &conn)
        .await;
    let _incoming = events.recv().await;

    manager.reject(PHONE_ID).await.unwrap();

    let response = read_packet(&mut phone).await;
    assert_eq!(response.body_bool("pair"), Some(false));
    assert!(!manager.is_paired(PHONE_ID));
}

/// Trust must survive a daemon restart: a fresh manager over the same
/// directory reports the device as paired.
#[tokio::test]
async fn trust_survives_manager_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (manager, mut events) = new_manager(dir.path());
        let (conn, mut phone) = phone_connection();
        manager
            .handle_pair_packet(&pair_packet_from_phone(true), &conn)
            .await;
        let _incoming = events.recv().await;
        manager.accept(PHONE_ID).await.unwrap();
        let _response = read_packet(&mut phone).await;
    }

    let (restarted, _events) = new_manager(dir.path());
    assert!(restarted.is_paired(PHONE_ID));
    assert_eq!(restarted.paired_devices(), vec![PHONE_ID.to_string()]);
}

/// Unpairing removes the trust file and a subsequent restart agrees.
#[tokio::test]
async fn unpair_is_durable_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (manager, mut events) = new_manager(dir.path());
        let (conn, mut phone) = phone_connection();
        manager
            .handle_pair_packet(&pair_packet_from_phone(true), &conn)
            .await;
        let _incoming = events.recv().await;
        manager.accept(PHONE_ID).await.unwrap();
        let _response = read_packet(&mut phone).await;

        manager.unpair(PHONE_ID, None).await.unwrap();
        assert!(!manager.is_paired(PHONE_ID));
    }

    let (restarted, _events) = new_manager(dir.path());
    assert!(!restarted.is_paired(PHONE_ID));
}
