//! UDP broadcast-based presence discovery.
//!
//! The daemon binds the well-known discovery port, broadcasts its own
//! identity packet on a fixed interval, and learns of peers from their
//! broadcasts. No encrypted channel is established here; discovery only
//! produces a registry of recently-seen devices and `Found` / `Lost`
//! events for the orchestrator.
//!
//! Everything arriving on this socket is untrusted. A datagram is silently
//! ignored (debug-log only, never an error) when it fails to decode, is not
//! an identity packet, carries an invalid device identifier, or echoes our
//! own identifier back (broadcast loopback).
//!
//! A periodic sweep evicts devices that have not re-announced within the
//! staleness window and fires `Lost` exactly once per eviction.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use devicelink_core::protocol::{codec, IdentityInfo};

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The service is not running (start() not called or stop() already called).
    #[error("discovery service is not running")]
    NotRunning,

    /// An I/O error occurred while sending a datagram.
    #[error("send error: {0}")]
    Send(#[from] std::io::Error),
}

/// A device recently seen announcing itself on the local network.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// The identity the device announced (id, name, class, version, port).
    pub identity: IdentityInfo,
    /// Source address of the most recent announcement.
    pub address: SocketAddr,
    /// When the most recent announcement arrived.
    pub last_seen: Instant,
}

/// Events produced by the discovery service.
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A device identifier was seen for the first time.
    Found(DiscoveredDevice),
    /// A device stopped re-announcing and was evicted.
    Lost(String),
}

/// Timing parameters for the discovery loops.
#[derive(Debug, Clone)]
pub struct DiscoveryTiming {
    pub broadcast_interval: Duration,
    pub sweep_interval: Duration,
    pub device_timeout: Duration,
}

impl Default for DiscoveryTiming {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            device_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the discovery UDP socket and the discovered-device registry.
pub struct DiscoveryService {
    identity: IdentityInfo,
    discovery_port: u16,
    timing: DiscoveryTiming,
    registry: Arc<Mutex<HashMap<String, DiscoveredDevice>>>,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    socket: Option<Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Creates the service. Nothing touches the network until [`Self::start`].
    ///
    /// Returns the service and the receiver for [`DiscoveryEvent`]s.
    pub fn new(
        identity: IdentityInfo,
        discovery_port: u16,
        timing: DiscoveryTiming,
    ) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            Self {
                identity,
                discovery_port,
                timing,
                registry: Arc::new(Mutex::new(HashMap::new())),
                event_tx,
                socket: None,
                tasks: Vec::new(),
            },
            event_rx,
        )
    }

    /// Binds the discovery socket in broadcast mode and spawns the
    /// broadcast, receive, and sweep loops. The first broadcast goes out
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::BindFailed`] if the socket cannot be bound.
    pub async fn start(&mut self) -> Result<(), DiscoveryError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.discovery_port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| DiscoveryError::BindFailed { addr, source })?;
        socket.set_broadcast(true).map_err(DiscoveryError::Send)?;
        let socket = Arc::new(socket);
        self.socket = Some(Arc::clone(&socket));
        info!("discovery listening on UDP {addr}");

        // Broadcast loop: one announcement now, then on the fixed interval.
        let announce = announce_line(&self.identity);
        let broadcast_target =
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.discovery_port);
        let broadcast_socket = Arc::clone(&socket);
        let interval = self.timing.broadcast_interval;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = broadcast_socket
                    .send_to(announce.as_bytes(), broadcast_target)
                    .await
                {
                    warn!("identity broadcast failed: {e}");
                }
            }
        }));

        // Receive loop.
        let recv_socket = Arc::clone(&socket);
        let registry = Arc::clone(&self.registry);
        let event_tx = self.event_tx.clone();
        let own_id = self.identity.device_id.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let (len, src) = match recv_socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("discovery recv error: {e}");
                        continue;
                    }
                };
                let datagram = String::from_utf8_lossy(&buf[..len]).into_owned();
                handle_datagram(&datagram, src, &own_id, &registry, &event_tx).await;
            }
        }));

        // Staleness sweep.
        let registry = Arc::clone(&self.registry);
        let event_tx = self.event_tx.clone();
        let sweep_interval = self.timing.sweep_interval;
        let device_timeout = self.timing.device_timeout;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                sweep_stale(&registry, &event_tx, device_timeout).await;
            }
        }));

        Ok(())
    }

    /// Sends a directed (unicast) identity announcement to a specific
    /// endpoint — used to wake a known device instead of waiting for its
    /// next broadcast, and for reconnection probing.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotRunning`] before `start()` / after
    /// `stop()`, or a send error.
    pub async fn announce_to(&self, target: SocketAddr) -> Result<(), DiscoveryError> {
        let socket = self.socket.as_ref().ok_or(DiscoveryError::NotRunning)?;
        let line = announce_line(&self.identity);
        socket.send_to(line.as_bytes(), target).await?;
        debug!("directed announcement sent to {target}");
        Ok(())
    }

    /// Snapshot of the currently discovered devices.
    pub async fn devices(&self) -> Vec<DiscoveredDevice> {
        self.registry.lock().await.values().cloned().collect()
    }

    /// Looks up one discovered device by identifier.
    pub async fn get(&self, device_id: &str) -> Option<DiscoveredDevice> {
        self.registry.lock().await.get(device_id).cloned()
    }

    /// Closes the socket, stops all loops, and clears the registry.
    /// Idempotent.
    pub async fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.socket = None;
        self.registry.lock().await.clear();
        info!("discovery stopped");
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn announce_line(identity: &IdentityInfo) -> String {
    // Identity serialization cannot fail; fall back to an empty line if it
    // somehow does rather than taking the broadcast loop down.
    codec::encode(&identity.to_packet()).unwrap_or_default()
}

/// Decodes and applies one received datagram. Hostile or malformed input
/// is dropped with a debug trace; only a brand-new identifier produces an
/// event.
async fn handle_datagram(
    datagram: &str,
    src: SocketAddr,
    own_id: &str,
    registry: &Mutex<HashMap<String, DiscoveredDevice>>,
    event_tx: &mpsc::Sender<DiscoveryEvent>,
) {
    let packet = match codec::decode(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("undecodable datagram from {src}: {e}");
            return;
        }
    };
    let identity = match IdentityInfo::from_packet(&packet) {
        Ok(identity) => identity,
        Err(e) => {
            debug!("ignoring non-identity datagram from {src}: {e}");
            return;
        }
    };
    if identity.device_id == own_id {
        // Our own broadcast looped back.
        return;
    }

    let device = DiscoveredDevice {
        identity,
        address: src,
        last_seen: Instant::now(),
    };

    let is_new = {
        let mut registry = registry.lock().await;
        let is_new = !registry.contains_key(&device.identity.device_id);
        registry.insert(device.identity.device_id.clone(), device.clone());
        is_new
    };

    if is_new {
        info!(
            "device found: {} ({}) at {src}",
            device.identity.device_name, device.identity.device_id
        );
        let _ = event_tx.send(DiscoveryEvent::Found(device)).await;
    }
}

/// Removes devices whose last announcement is older than `device_timeout`
/// and fires `Lost` exactly once per removal.
async fn sweep_stale(
    registry: &Mutex<HashMap<String, DiscoveredDevice>>,
    event_tx: &mpsc::Sender<DiscoveryEvent>,
    device_timeout: Duration,
) {
    let now = Instant::now();
    let evicted: Vec<String> = {
        let mut registry = registry.lock().await;
        let stale: Vec<String> = registry
            .iter()
            .filter(|(_, d)| now.duration_since(d.last_seen) > device_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            registry.remove(id);
        }
        stale
    };
    for id in evicted {
        info!("device lost (stale): {id}");
        let _ = event_tx.send(DiscoveryEvent::Lost(id)).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
