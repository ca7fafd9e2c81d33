//! Connection manager: turns known endpoints into live, mutually
//! authenticated encrypted sessions.
//!
//! Owns the TCP listener (first free port in the protocol's 1716–1764
//! range) and the registry of authenticated [`DeviceConnection`]s, keyed by
//! device identifier. Two rules keep the registry sane under races:
//!
//! - A per-identifier *pending* set is the single source of truth
//!   preventing two simultaneous handshakes for the same device (an
//!   outbound dial racing an inbound accept).
//! - A newer completed connection for an identifier silently retires the
//!   older one: the old entry closes without firing `Disconnected`, and
//!   the replacement fires no second `Connected`. Cleanup compares entry
//!   identity (`Arc::ptr_eq`), never deletion order.
//!
//! Incoming bytes on every live session are fed to the [`PacketRouter`];
//! handshake leftover bytes are replayed there first.

pub mod handshake;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use devicelink_core::protocol::{codec, IdentityError, IdentityInfo, NetworkPacket, PacketError};

use crate::discovery::DiscoveredDevice;
use crate::router::PacketRouter;
use crate::tlsconfig::TlsIdentity;

use handshake::HandshakeOutcome;

/// Boxed halves so sessions ride a TLS stream in production and an
/// in-memory duplex in tests.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport a completed handshake hands to registration: a TLS stream in
/// production, an in-memory duplex in tests.
pub trait SessionTransport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionTransport for T {}

/// Errors raised by connection establishment and session I/O.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No free TCP port in the whole listen range. Fatal.
    #[error("no free TCP port in {start}..={end}")]
    BindFailed { start: u16, end: u16 },

    /// The outbound TCP connect failed.
    #[error("failed to dial {addr}: {source}")]
    DialFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A handshake for this identifier is already in flight.
    #[error("handshake already in progress for {0}")]
    HandshakeInProgress(String),

    /// The discovered device announced no TCP port to dial.
    #[error("device {0} announced no TCP port")]
    NoAnnouncedPort(String),

    /// The peer did not complete the identity exchange in time.
    #[error("identity exchange timed out")]
    IdentityTimeout,

    /// The TLS negotiation did not complete in time.
    #[error("TLS negotiation timed out")]
    HandshakeTimeout,

    /// The peer's identity line exceeded the accepted maximum.
    #[error("identity line too long")]
    IdentityTooLong,

    /// The peer sent a malformed packet during the handshake.
    #[error("invalid packet during handshake: {0}")]
    Protocol(#[source] PacketError),

    /// The peer sent a malformed identity payload.
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[source] IdentityError),

    /// The requested device has no live session.
    #[error("device not connected: {0}")]
    NotConnected(String),

    /// The session is closed.
    #[error("connection closed")]
    Closed,

    /// Underlying socket/TLS I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events emitted to the orchestrator.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A handshake completed and the session is registered.
    Connected(Arc<DeviceConnection>),
    /// A registered session ended (socket close or error). Not fired for
    /// sessions retired by a newer connection for the same identifier.
    Disconnected { device_id: String },
}

static NEXT_CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// One live, authenticated session with a device.
pub struct DeviceConnection {
    sequence: u64,
    device_id: String,
    device_name: String,
    protocol_version: i64,
    peer_cert_pem: Option<String>,
    address: Option<SocketAddr>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    alive: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl DeviceConnection {
    /// Builds a session around a transport writer half. The reader half is
    /// driven separately (see [`ConnectionManager`]'s read pump).
    pub fn new(
        identity: &IdentityInfo,
        peer_cert_pem: Option<String>,
        writer: BoxedWriter,
        address: Option<SocketAddr>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            sequence: NEXT_CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed),
            device_id: identity.device_id.clone(),
            device_name: identity.device_name.clone(),
            protocol_version: identity.protocol_version,
            peer_cert_pem,
            address,
            writer: tokio::sync::Mutex::new(writer),
            alive: AtomicBool::new(true),
            closed_tx,
        }
    }

    /// Process-unique sequence number; also the router's buffer key, so a
    /// replacement connection never inherits its predecessor's partial
    /// line.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn protocol_version(&self) -> i64 {
        self.protocol_version
    }

    /// The peer's certificate as presented during the TLS handshake.
    /// Absent on transports without certificates (tests).
    pub fn peer_cert_pem(&self) -> Option<&str> {
        self.peer_cert_pem.as_deref()
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Serializes and writes one packet.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Closed`] once the session has ended; I/O errors
    /// mark the session dead.
    pub async fn send(&self, packet: &NetworkPacket) -> Result<(), ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::Closed);
        }
        let line = codec::encode(packet).map_err(ConnectionError::Protocol)?;
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            self.mark_closed();
            return Err(ConnectionError::Io(e));
        }
        Ok(())
    }

    /// Closes the session: further sends fail and the read pump stops.
    pub async fn close(&self) {
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn mark_closed(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.closed_tx.send(true);
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("sequence", &self.sequence)
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("protocol_version", &self.protocol_version)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Summary of one live session, for the accessor surface.
#[derive(Debug, Clone)]
pub struct ConnectedDeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub protocol_version: i64,
    pub address: Option<SocketAddr>,
}

/// Removes its key from the pending set when dropped, so every handshake
/// exit path (success, error, panic) releases the claim.
struct PendingClaim {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl PendingClaim {
    /// Claims `key`, or fails if a handshake already holds it.
    fn claim(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Result<Self, ConnectionError> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(key.to_string()) {
            return Err(ConnectionError::HandshakeInProgress(key.to_string()));
        }
        Ok(Self {
            set: Arc::clone(set),
            key: key.to_string(),
        })
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.key);
    }
}

/// Owns the listener, the dial paths, and the live-session registry.
pub struct ConnectionManager {
    our_identity: Mutex<IdentityInfo>,
    tls: Arc<TlsIdentity>,
    router: Arc<PacketRouter>,
    identity_timeout: Duration,
    connections: Arc<Mutex<HashMap<String, Arc<DeviceConnection>>>>,
    pending: Arc<Mutex<HashSet<String>>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates the manager. Returns it with the event receiver.
    pub fn new(
        our_identity: IdentityInfo,
        tls: Arc<TlsIdentity>,
        router: Arc<PacketRouter>,
        identity_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                our_identity: Mutex::new(our_identity),
                tls,
                router,
                identity_timeout,
                connections: Arc::new(Mutex::new(HashMap::new())),
                pending: Arc::new(Mutex::new(HashSet::new())),
                event_tx,
                listener_task: Mutex::new(None),
            }),
            event_rx,
        )
    }

    /// The identity we assert in handshakes, with the listener port once
    /// bound.
    pub fn identity(&self) -> IdentityInfo {
        self.our_identity.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Binds the first free port in `start..=end` and spawns the accept
    /// loop. Returns the bound port (also written into our identity, so
    /// subsequent announcements advertise it).
    ///
    /// # Errors
    ///
    /// [`ConnectionError::BindFailed`] if every port in the range is taken.
    pub async fn start_listener(
        self: &Arc<Self>,
        start: u16,
        end: u16,
    ) -> Result<u16, ConnectionError> {
        let mut listener = None;
        for port in start..=end {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(bound) => {
                    listener = Some((bound, port));
                    break;
                }
                Err(e) => debug!("port {port} unavailable: {e}"),
            }
        }
        let (listener, port) = listener.ok_or(ConnectionError::BindFailed { start, end })?;
        info!("session listener on TCP port {port}");

        {
            let mut identity = self.our_identity.lock().unwrap_or_else(|e| e.into_inner());
            identity.tcp_port = Some(port);
        }

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            if let Err(e) = manager.handle_inbound(stream, peer_addr).await {
                                debug!("inbound handshake from {peer_addr} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                }
            }
        });
        *self.listener_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(port)
    }

    /// Dials a discovered device and runs the outbound handshake.
    pub async fn connect(
        self: &Arc<Self>,
        device: &DiscoveredDevice,
    ) -> Result<Arc<DeviceConnection>, ConnectionError> {
        let device_id = device.identity.device_id.clone();
        let port = device
            .identity
            .tcp_port
            .ok_or_else(|| ConnectionError::NoAnnouncedPort(device_id.clone()))?;
        let addr = SocketAddr::new(device.address.ip(), port);

        let _claim = PendingClaim::claim(&self.pending, &device_id)?;

        let stream = self.dial(addr).await?;
        let outcome = handshake::outbound(
            stream,
            &self.identity(),
            Some(&device.identity),
            &self.tls,
            self.identity_timeout,
        )
        .await?;
        Ok(self.register(outcome, addr).await)
    }

    /// Dials a raw address with no prior discovery (manual IP entry). The
    /// handshake itself resolves the device identifier; until then the
    /// pending claim uses a synthetic placeholder key.
    pub async fn connect_addr(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<Arc<DeviceConnection>, ConnectionError> {
        let placeholder = format!("pending-{addr}");
        let _claim = PendingClaim::claim(&self.pending, &placeholder)?;

        let stream = self.dial(addr).await?;
        let outcome = handshake::outbound(
            stream,
            &self.identity(),
            None,
            &self.tls,
            self.identity_timeout,
        )
        .await?;
        Ok(self.register(outcome, addr).await)
    }

    /// Opens the TCP connection, bounded by the handshake timeout. A dial
    /// that hangs must not hold the pending claim for its identifier
    /// indefinitely.
    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream, ConnectionError> {
        tokio::time::timeout(self.identity_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::DialFailed {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| ConnectionError::DialFailed { addr, source })
    }

    /// Inbound path: plaintext identity, duplicate check, TLS upgrade.
    async fn handle_inbound(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let plaintext_identity =
            handshake::inbound_identity(&mut stream, self.identity_timeout).await?;

        // One in-flight handshake per identifier; a lost claim means an
        // outbound dial (or another inbound socket) is already working on
        // this device and this socket is surplus.
        let _claim = PendingClaim::claim(&self.pending, &plaintext_identity.device_id)?;

        let outcome = handshake::inbound_upgrade(
            stream,
            peer_addr,
            plaintext_identity,
            &self.identity(),
            &self.tls,
            self.identity_timeout,
        )
        .await?;
        self.register(outcome, peer_addr).await;
        Ok(())
    }

    /// Registers a completed handshake, replacing (and silently retiring)
    /// any previous session for the identifier, replays handshake leftover
    /// into the router, and starts the read pump.
    async fn register(
        self: &Arc<Self>,
        outcome: HandshakeOutcome,
        addr: SocketAddr,
    ) -> Arc<DeviceConnection> {
        let (reader, writer) = tokio::io::split(outcome.stream);
        let conn = Arc::new(DeviceConnection::new(
            &outcome.identity,
            outcome.peer_cert_pem,
            Box::new(writer),
            Some(addr),
        ));

        let replaced = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.insert(conn.device_id.clone(), Arc::clone(&conn))
        };
        let superseding = replaced.is_some();
        if let Some(old) = replaced {
            debug!(
                "connection {} supersedes {} for {}",
                conn.sequence, old.sequence, conn.device_id
            );
            // Retire quietly: the replaced entry is no longer registered,
            // so its pump cleanup will not fire Disconnected.
            old.mark_closed();
            self.router.reset(old.sequence());
        }

        if !outcome.leftover.is_empty() {
            self.router.ingest(&conn, &outcome.leftover);
        }

        self.spawn_read_pump(Arc::clone(&conn), Box::new(reader));

        info!(
            "connected: {} ({}) v{}",
            conn.device_name, conn.device_id, conn.protocol_version
        );
        if !superseding {
            let _ = self
                .event_tx
                .send(ConnectionEvent::Connected(Arc::clone(&conn)))
                .await;
        }
        conn
    }

    /// Drives one session's reads into the router until close/EOF/error,
    /// then cleans up.
    fn spawn_read_pump(self: &Arc<Self>, conn: Arc<DeviceConnection>, mut reader: BoxedReader) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut closed = conn.closed_signal();
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                    }
                    result = reader.read(&mut buf) => match result {
                        Ok(0) => break,
                        Ok(n) => manager.router.ingest(&conn, &buf[..n]),
                        Err(e) => {
                            debug!("read error on {}: {e}", conn.device_id);
                            break;
                        }
                    }
                }
            }
            manager.cleanup(&conn).await;
        });
    }

    /// Post-session cleanup. Fires `Disconnected` only if `conn` is still
    /// the registered session for its identifier; a session replaced by a
    /// newer one goes quietly.
    async fn cleanup(&self, conn: &Arc<DeviceConnection>) {
        conn.mark_closed();
        self.router.reset(conn.sequence());

        let was_current = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            match connections.get(&conn.device_id) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    connections.remove(&conn.device_id);
                    true
                }
                _ => false,
            }
        };

        if was_current {
            info!("disconnected: {}", conn.device_id);
            let _ = self
                .event_tx
                .send(ConnectionEvent::Disconnected {
                    device_id: conn.device_id.clone(),
                })
                .await;
        }
    }

    /// The live session for a device, if any.
    pub fn get_connection(&self, device_id: &str) -> Option<Arc<DeviceConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    /// Snapshot of all live sessions.
    pub fn connected_devices(&self) -> Vec<ConnectedDeviceInfo> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|c| ConnectedDeviceInfo {
                device_id: c.device_id.clone(),
                device_name: c.device_name.clone(),
                protocol_version: c.protocol_version,
                address: c.address,
            })
            .collect()
    }

    /// Closes the session for `device_id`, if live.
    pub async fn disconnect(&self, device_id: &str) -> Result<(), ConnectionError> {
        let conn = self
            .get_connection(device_id)
            .ok_or_else(|| ConnectionError::NotConnected(device_id.to_string()))?;
        conn.close().await;
        Ok(())
    }

    /// Stops the listener and closes every live session.
    pub async fn shutdown(&self) {
        if let Some(task) = self
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let connections: Vec<Arc<DeviceConnection>> = {
            let guard = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        for conn in connections {
            conn.close().await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
