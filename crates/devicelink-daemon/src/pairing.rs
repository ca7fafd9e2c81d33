//! Pairing and trust: the certificate trust store and the pair-packet
//! handshake.
//!
//! Trust is a directory of PEM files, one per device identifier, mirrored
//! into an in-memory set so `is_paired` is an O(1) lookup. A device becomes
//! trusted through exactly one flow: the pair-packet exchange over a live
//! encrypted connection, confirmed by a human comparing the verification
//! key on both screens. The verification key is derived from both leaf
//! certificates in a fixed order, so both sides compute the same string
//! regardless of who initiated.
//!
//! Per-device pairing state: untrusted, pairing-outgoing (we sent the
//! request and armed a timeout), pairing-incoming (the peer asked and we
//! hold a pending [`PairingRequest`]), trusted. Reject, timeout, and unpair
//! all land back at untrusted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use devicelink_core::protocol::{codec, NetworkPacket, PACKET_TYPE_PAIR};

use crate::connection::{ConnectionError, DeviceConnection};

/// Errors raised by the pairing flows and the trust store.
#[derive(Debug, Error)]
pub enum PairingError {
    /// The trust directory could not be created or accessed.
    #[error("trust store at {path}: {source}")]
    TrustStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No pending incoming request exists for this device.
    #[error("no pending pairing request from {0}")]
    NoPendingRequest(String),

    /// A pairing exchange for this device is already in flight.
    #[error("pairing already in progress with {0}")]
    AlreadyInProgress(String),

    /// The device is already trusted.
    #[error("device already paired: {0}")]
    AlreadyPaired(String),

    /// The connection presented no peer certificate to persist.
    #[error("no peer certificate available for {0}")]
    NoPeerCertificate(String),

    /// Sending the pairing packet failed.
    #[error("failed to send pairing packet: {0}")]
    Send(#[from] ConnectionError),
}

/// An incoming pairing request awaiting a user decision.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub device_id: String,
    pub device_name: String,
    /// The verification key the user should compare against the phone.
    pub verification_key: String,
    pub received_at: std::time::SystemTime,
}

/// Events emitted to the orchestrator.
#[derive(Debug)]
pub enum PairingEvent {
    /// An outgoing or incoming pairing flow concluded.
    Result {
        device_id: String,
        success: bool,
        message: Option<String>,
    },
    /// The peer asked to pair; the user must accept or reject.
    Incoming(PairingRequest),
    /// Trust was revoked for a device.
    Unpaired { device_id: String },
}

struct PendingOutgoing {
    connection: Arc<DeviceConnection>,
    timeout_task: JoinHandle<()>,
}

struct PendingIncoming {
    request: PairingRequest,
    connection: Arc<DeviceConnection>,
}

/// Owns the trust store and all in-flight pairing exchanges.
pub struct PairingManager {
    trust_dir: PathBuf,
    trusted: Mutex<HashSet<String>>,
    our_cert_pem: String,
    pairing_timeout: Duration,
    outgoing: Mutex<HashMap<String, PendingOutgoing>>,
    incoming: Mutex<HashMap<String, PendingIncoming>>,
    event_tx: mpsc::Sender<PairingEvent>,
}

impl PairingManager {
    /// Opens (creating if needed) the trust directory and loads the set of
    /// trusted identifiers from its `*.pem` entries.
    pub fn new(
        trust_dir: &Path,
        our_cert_pem: String,
        pairing_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::Receiver<PairingEvent>), PairingError> {
        std::fs::create_dir_all(trust_dir).map_err(|source| PairingError::TrustStore {
            path: trust_dir.to_path_buf(),
            source,
        })?;

        let mut trusted = HashSet::new();
        let entries = std::fs::read_dir(trust_dir).map_err(|source| PairingError::TrustStore {
            path: trust_dir.to_path_buf(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "pem") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    trusted.insert(stem.to_string());
                }
            }
        }
        info!("trust store: {} paired device(s)", trusted.len());

        let (event_tx, event_rx) = mpsc::channel(16);
        Ok((
            Arc::new(Self {
                trust_dir: trust_dir.to_path_buf(),
                trusted: Mutex::new(trusted),
                our_cert_pem,
                pairing_timeout,
                outgoing: Mutex::new(HashMap::new()),
                incoming: Mutex::new(HashMap::new()),
                event_tx,
            }),
            event_rx,
        ))
    }

    /// Whether a completed pairing exists for this device.
    pub fn is_paired(&self, device_id: &str) -> bool {
        self.trusted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device_id)
    }

    /// Identifiers of all trusted devices.
    pub fn paired_devices(&self) -> Vec<String> {
        self.trusted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Sends a pairing request over a live connection, arms the timeout,
    /// and returns the verification key for display.
    ///
    /// # Errors
    ///
    /// Fails when the device is already paired, a flow is already in
    /// flight, the connection carries no peer certificate, or the send
    /// fails.
    pub async fn request_pairing(
        self: &Arc<Self>,
        connection: Arc<DeviceConnection>,
    ) -> Result<String, PairingError> {
        let device_id = connection.device_id().to_string();
        if self.is_paired(&device_id) {
            return Err(PairingError::AlreadyPaired(device_id));
        }
        let peer_cert = connection
            .peer_cert_pem()
            .ok_or_else(|| PairingError::NoPeerCertificate(device_id.clone()))?
            .to_string();

        // Reserve the slot before the first await point so two concurrent
        // requests for the same device cannot both pass the check.
        let manager = Arc::clone(self);
        let timeout_id = device_id.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(manager.pairing_timeout).await;
            manager.fail_outgoing(&timeout_id, "pairing timed out").await;
        });
        {
            let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            if outgoing.contains_key(&device_id) {
                timeout_task.abort();
                return Err(PairingError::AlreadyInProgress(device_id));
            }
            outgoing.insert(
                device_id.clone(),
                PendingOutgoing {
                    connection: Arc::clone(&connection),
                    timeout_task,
                },
            );
        }

        if let Err(e) = connection.send(&pair_packet(true)).await {
            // The request never reached the peer; free the slot.
            if let Some(pending) = self
                .outgoing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&device_id)
            {
                pending.timeout_task.abort();
            }
            return Err(PairingError::Send(e));
        }

        Ok(verification_key(&self.our_cert_pem, &peer_cert))
    }

    /// Accepts a pending incoming request: sends `pair=true` back, persists
    /// the peer certificate, and fires a success result.
    pub async fn accept(&self, device_id: &str) -> Result<(), PairingError> {
        let pending = self
            .incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id)
            .ok_or_else(|| PairingError::NoPendingRequest(device_id.to_string()))?;

        let peer_cert = pending
            .connection
            .peer_cert_pem()
            .ok_or_else(|| PairingError::NoPeerCertificate(device_id.to_string()))?
            .to_string();

        pending.connection.send(&pair_packet(true)).await?;
        self.persist_trust(device_id, &peer_cert)?;
        info!("paired with {device_id} (accepted incoming request)");
        let _ = self
            .event_tx
            .send(PairingEvent::Result {
                device_id: device_id.to_string(),
                success: true,
                message: None,
            })
            .await;
        Ok(())
    }

    /// Rejects a pending incoming request: sends `pair=false` back and
    /// clears the request. Trust is untouched.
    pub async fn reject(&self, device_id: &str) -> Result<(), PairingError> {
        let pending = self
            .incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id)
            .ok_or_else(|| PairingError::NoPendingRequest(device_id.to_string()))?;

        pending.connection.send(&pair_packet(false)).await?;
        info!("rejected pairing request from {device_id}");
        let _ = self
            .event_tx
            .send(PairingEvent::Result {
                device_id: device_id.to_string(),
                success: false,
                message: Some("rejected locally".to_string()),
            })
            .await;
        Ok(())
    }

    /// Revokes trust. Optionally notifies the peer and closes the session.
    pub async fn unpair(
        &self,
        device_id: &str,
        connection: Option<Arc<DeviceConnection>>,
    ) -> Result<(), PairingError> {
        let removed = {
            let mut trusted = self.trusted.lock().unwrap_or_else(|e| e.into_inner());
            trusted.remove(device_id)
        };
        if removed {
            let path = self.trust_path(device_id);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("failed to remove trust file {}: {e}", path.display());
            }
        }

        if let Some(conn) = connection {
            let _ = conn.send(&pair_packet(false)).await;
            conn.close().await;
        }

        if removed {
            info!("unpaired {device_id}");
            let _ = self
                .event_tx
                .send(PairingEvent::Unpaired {
                    device_id: device_id.to_string(),
                })
                .await;
        }
        Ok(())
    }

    /// Handles an incoming `kdeconnect.pair` packet from a live connection.
    /// This is the router handler's entry point.
    pub async fn handle_pair_packet(
        self: &Arc<Self>,
        packet: &NetworkPacket,
        connection: &Arc<DeviceConnection>,
    ) {
        let wants_pair = packet.body_bool("pair").unwrap_or(false);
        let device_id = connection.device_id().to_string();

        if wants_pair {
            self.handle_pair_request(&device_id, connection).await;
        } else {
            self.handle_pair_refusal(&device_id).await;
        }
    }

    /// Peer sent `pair=true`: either the acceptance of our outgoing request
    /// or a fresh incoming request.
    async fn handle_pair_request(
        self: &Arc<Self>,
        device_id: &str,
        connection: &Arc<DeviceConnection>,
    ) {
        let accepted_ours = {
            let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            outgoing.remove(device_id)
        };

        if let Some(pending) = accepted_ours {
            pending.timeout_task.abort();
            let Some(peer_cert) = pending.connection.peer_cert_pem().map(str::to_string) else {
                self.emit_result(device_id, false, Some("no peer certificate")).await;
                return;
            };
            if let Err(e) = self.persist_trust(device_id, &peer_cert) {
                warn!("failed to persist trust for {device_id}: {e}");
                self.emit_result(device_id, false, Some("trust store write failed"))
                    .await;
                return;
            }
            info!("paired with {device_id} (peer accepted our request)");
            self.emit_result(device_id, true, None).await;
            return;
        }

        if self.is_paired(device_id) {
            // Re-pair request from an already-trusted peer; confirm.
            debug!("pair request from already-trusted {device_id}, confirming");
            let _ = connection.send(&pair_packet(true)).await;
            return;
        }

        let verification_key = connection
            .peer_cert_pem()
            .map(|peer| verification_key(&self.our_cert_pem, peer))
            .unwrap_or_default();
        let request = PairingRequest {
            device_id: device_id.to_string(),
            device_name: connection.device_name().to_string(),
            verification_key,
            received_at: std::time::SystemTime::now(),
        };
        {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            incoming.insert(
                device_id.to_string(),
                PendingIncoming {
                    request: request.clone(),
                    connection: Arc::clone(connection),
                },
            );
        }
        info!("incoming pairing request from {device_id}");
        let _ = self.event_tx.send(PairingEvent::Incoming(request)).await;
    }

    /// Peer sent `pair=false`: a rejection of our outgoing request, an
    /// unpair of an existing trust, or a cancellation of its own request.
    async fn handle_pair_refusal(self: &Arc<Self>, device_id: &str) {
        let rejected_ours = {
            let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            outgoing.remove(device_id)
        };
        if let Some(pending) = rejected_ours {
            pending.timeout_task.abort();
            info!("pairing rejected by {device_id}");
            self.emit_result(device_id, false, Some("rejected by peer")).await;
            return;
        }

        let withdrawn = {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            incoming.remove(device_id).is_some()
        };
        if withdrawn {
            debug!("pairing request withdrawn by {device_id}");
            self.emit_result(device_id, false, Some("withdrawn by peer")).await;
            return;
        }

        if self.is_paired(device_id) {
            info!("unpair requested by {device_id}");
            let _ = self.unpair(device_id, None).await;
        }
    }

    /// Drops all pending flows and their timers. Used at shutdown and when
    /// a device disconnects mid-pairing.
    pub fn cancel_pending(&self, device_id: &str) {
        if let Some(pending) = self
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id)
        {
            pending.timeout_task.abort();
        }
        self.incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
    }

    /// Cancels every pending flow. All timers are aborted.
    pub fn shutdown(&self) {
        let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        for (_, pending) in outgoing.drain() {
            pending.timeout_task.abort();
        }
        self.incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// The pending incoming request for a device, if any.
    pub fn pending_request(&self, device_id: &str) -> Option<PairingRequest> {
        self.incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .map(|p| p.request.clone())
    }

    async fn fail_outgoing(&self, device_id: &str, message: &str) {
        let pending = {
            let mut outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            outgoing.remove(device_id)
        };
        if pending.is_some() {
            warn!("pairing with {device_id} failed: {message}");
            self.emit_result(device_id, false, Some(message)).await;
        }
    }

    async fn emit_result(&self, device_id: &str, success: bool, message: Option<&str>) {
        let _ = self
            .event_tx
            .send(PairingEvent::Result {
                device_id: device_id.to_string(),
                success,
                message: message.map(str::to_string),
            })
            .await;
    }

    fn trust_path(&self, device_id: &str) -> PathBuf {
        self.trust_dir.join(format!("{device_id}.pem"))
    }

    fn persist_trust(&self, device_id: &str, peer_cert_pem: &str) -> Result<(), PairingError> {
        let path = self.trust_path(device_id);
        std::fs::write(&path, peer_cert_pem).map_err(|source| PairingError::TrustStore {
            path,
            source,
        })?;
        self.trusted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string());
        Ok(())
    }
}

/// Builds a `kdeconnect.pair` packet.
fn pair_packet(pair: bool) -> NetworkPacket {
    let mut body = Map::new();
    body.insert("pair".to_string(), json!(pair));
    body.insert(
        "timestamp".to_string(),
        json!(codec::current_timestamp_ms()),
    );
    NetworkPacket::new(PACKET_TYPE_PAIR, body)
}

/// Derives the human-verifiable key both sides display during pairing:
/// SHA-256 over both certificate PEMs in lexicographic order, truncated to
/// the first eight hex digits, uppercased. Order-independence makes the
/// two sides agree without negotiating who hashes first.
pub fn verification_key(cert_a_pem: &str, cert_b_pem: &str) -> String {
    let (first, second) = if cert_a_pem <= cert_b_pem {
        (cert_a_pem, cert_b_pem)
    } else {
        (cert_b_pem, cert_a_pem)
    };
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(second.as_bytes());
    let digest = hasher.finalize();
    digest[..4]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<String>()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use devicelink_core::protocol::{DeviceType, IdentityInfo, PROTOCOL_VERSION};
    use tokio::io::duplex;

    const PEER_ID: &str = "44444444444444444444444444444444";

    fn connection_with_cert(cert: Option<&str>) -> Arc<DeviceConnection> {
        let identity = IdentityInfo {
            device_id: PEER_ID.to_string(),
            device_name: "pairing-peer".to_string(),
            device_type: DeviceType::Phone,
            protocol_version: PROTOCOL_VERSION,
            tcp_port: None,
            incoming_capabilities: vec![],
            outgoing_capabilities: vec![],
        };
        let (ours, theirs) = duplex(16 * 1024);
        std::mem::forget(theirs);
        Arc::new(DeviceConnection::new(
            &identity,
            cert.map(str::to_string),
            Box::new(ours),
            None,
        ))
    }

    fn new_manager(
        dir: &Path,
    ) -> (Arc<PairingManager>, mpsc::Receiver<PairingEvent>) {
        PairingManager::new(dir, "OUR CERT".to_string(), Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn test_verification_key_is_order_independent() {
        let a = "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n";
        let b = "-----BEGIN CERTIFICATE-----\nBBB\n-----END CERTIFICATE-----\n";
        assert_eq!(verification_key(a, b), verification_key(b, a));
        assert_eq!(verification_key(a, b).len(), 8);
        assert!(verification_key(a, b)
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_verification_key_differs_for_different_certs() {
        assert_ne!(
            verification_key("cert-one", "cert-two"),
            verification_key("cert-one", "cert-three")
        );
    }

    #[tokio::test]
    async fn test_unpaired_device_reports_not_paired() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _events) = new_manager(dir.path());
        assert!(!manager.is_paired(PEER_ID));
    }

    #[tokio::test]
    async fn test_trust_survives_reload_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (manager, _events) = new_manager(dir.path());
            manager.persist_trust(PEER_ID, "PEER CERT").unwrap();
            assert!(manager.is_paired(PEER_ID));
        }
        let (reloaded, _events) = new_manager(dir.path());
        assert!(reloaded.is_paired(PEER_ID));
        assert_eq!(reloaded.paired_devices(), vec![PEER_ID.to_string()]);
    }

    #[tokio::test]
    async fn test_incoming_request_is_surfaced_and_accept_persists_trust() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut events) = new_manager(dir.path());
        let conn = connection_with_cert(Some("PEER CERT"));

        let packet = pair_packet(true);
        manager.handle_pair_packet(&packet, &conn).await;

        match events.recv().await {
            Some(PairingEvent::Incoming(request)) => {
                assert_eq!(request.device_id, PEER_ID);
                assert_eq!(request.device_name, "pairing-peer");
                assert!(!request.verification_key.is_empty());
            }
            other => panic!("expected incoming pairing event, got {other:?}"),
        }
        assert!(manager.pending_request(PEER_ID).is_some());
        assert!(!manager.is_paired(PEER_ID));

        manager.accept(PEER_ID).await.unwrap();
        assert!(manager.is_paired(PEER_ID));
        assert!(manager.pending_request(PEER_ID).is_none());
        assert!(dir.path().join(format!("{PEER_ID}.pem")).exists());

        match events.recv().await {
            Some(PairingEvent::Result { device_id, success, .. }) => {
                assert_eq!(device_id, PEER_ID);
                assert!(success);
            }
            other => panic!("expected pairing result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reject_clears_request_without_trust() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut events) = new_manager(dir.path());
        let conn = connection_with_cert(Some("PEER CERT"));

        manager.handle_pair_packet(&pair_packet(true), &conn).await;
        let _ = events.recv().await; // Incoming

        manager.reject(PEER_ID).await.unwrap();
        assert!(!manager.is_paired(PEER_ID));
        assert!(manager.pending_request(PEER_ID).is_none());

        match events.recv().await {
            Some(PairingEvent::Result { success, .. }) => assert!(!success),
            other => panic!("expected failure result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accept_without_pending_request_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _events) = new_manager(dir.path());
        assert!(matches!(
            manager.accept(PEER_ID).await,
            Err(PairingError::NoPendingRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_request_pairing_then_peer_accept_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut events) = new_manager(dir.path());
        let conn = connection_with_cert(Some("PEER CERT"));

        let key = manager.request_pairing(Arc::clone(&conn)).await.unwrap();
        assert_eq!(key, verification_key("OUR CERT", "PEER CERT"));

        manager.handle_pair_packet(&pair_packet(true), &conn).await;
        match events.recv().await {
            Some(PairingEvent::Result { device_id, success, .. }) => {
                assert_eq!(device_id, PEER_ID);
                assert!(success);
            }
            other => panic!("expected success result, got {other:?}"),
        }
        assert!(manager.is_paired(PEER_ID));
    }

    #[tokio::test]
    async fn test_request_pairing_then_peer_reject_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut events) = new_manager(dir.path());
        let conn = connection_with_cert(Some("PEER CERT"));

        manager.request_pairing(Arc::clone(&conn)).await.unwrap();
        manager.handle_pair_packet(&pair_packet(false), &conn).await;

        match events.recv().await {
            Some(PairingEvent::Result { success, message, .. }) => {
                assert!(!success);
                assert_eq!(message.as_deref(), Some("rejected by peer"));
            }
            other => panic!("expected failure result, got {other:?}"),
        }
        assert!(!manager.is_paired(PEER_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_request_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut events) =
            PairingManager::new(dir.path(), "OUR CERT".to_string(), Duration::from_secs(30))
                .unwrap();
        let conn = connection_with_cert(Some("PEER CERT"));

        manager.request_pairing(conn).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        match events.recv().await {
            Some(PairingEvent::Result { success, message, .. }) => {
                assert!(!success);
                assert_eq!(message.as_deref(), Some("pairing timed out"));
            }
            other => panic!("expected timeout result, got {other:?}"),
        }
        assert!(!manager.is_paired(PEER_ID));
    }

    #[tokio::test]
    async fn test_duplicate_outgoing_request_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _events) = new_manager(dir.path());
        let conn = connection_with_cert(Some("PEER CERT"));

        manager.request_pairing(Arc::clone(&conn)).await.unwrap();
        assert!(matches!(
            manager.request_pairing(conn).await,
            Err(PairingError::AlreadyInProgress(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_send_releases_outgoing_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _events) = new_manager(dir.path());
        let conn = connection_with_cert(Some("PEER CERT"));
        conn.close().await;

        assert!(matches!(
            manager.request_pairing(Arc::clone(&conn)).await,
            Err(PairingError::Send(_))
        ));
        // The slot must be free again: the retry fails on the dead
        // connection, not on a leaked in-progress reservation.
        assert!(matches!(
            manager.request_pairing(conn).await,
            Err(PairingError::Send(_))
        ));
    }

    #[tokio::test]
    async fn test_request_pairing_without_cert_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _events) = new_manager(dir.path());
        let conn = connection_with_cert(None);
        assert!(matches!(
            manager.request_pairing(conn).await,
            Err(PairingError::NoPeerCertificate(_))
        ));
    }

    #[tokio::test]
    async fn test_unpair_removes_trust_and_fires_event() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut events) = new_manager(dir.path());
        manager.persist_trust(PEER_ID, "PEER CERT").unwrap();

        manager.unpair(PEER_ID, None).await.unwrap();
        assert!(!manager.is_paired(PEER_ID));
        assert!(!dir.path().join(format!("{PEER_ID}.pem")).exists());

        match events.recv().await {
            Some(PairingEvent::Unpaired { device_id }) => assert_eq!(device_id, PEER_ID),
            other => panic!("expected unpaired event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_refusal_while_trusted_unpairs() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, mut events) = new_manager(dir.path());
        manager.persist_trust(PEER_ID, "PEER CERT").unwrap();
        let conn = connection_with_cert(Some("PEER CERT"));

        manager.handle_pair_packet(&pair_packet(false), &conn).await;
        assert!(!manager.is_paired(PEER_ID));
        assert!(matches!(
            events.recv().await,
            Some(PairingEvent::Unpaired { .. })
        ));
    }
}
