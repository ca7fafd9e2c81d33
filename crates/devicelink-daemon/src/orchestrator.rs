//! Wires the services together: discovery events to dialing, connection
//! events to lifecycle transitions, pairing results to trust and state,
//! disconnects to reconnection probing.
//!
//! The orchestrator owns no protocol logic of its own. It is the only
//! place that calls the lifecycle machine, so state transitions have a
//! single writer; every service keeps emitting events regardless of what
//! state the machine is in, and the orchestrator decides which events
//! matter.
//!
//! Auto-dial policy: a discovered device is dialed immediately only when
//! it is already paired. Unpaired devices just sit in the discovery
//! registry until the user asks to pair, which triggers the dial.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use devicelink_core::lifecycle::{
    ContextPatch, LifecycleMachine, LinkState, StateContext, TransitionRecord,
};
use devicelink_core::protocol::{DeviceType, IdentityInfo, PACKET_TYPE_PAIR, PROTOCOL_VERSION};

use crate::config::DaemonConfig;
use crate::connection::{
    ConnectedDeviceInfo, ConnectionError, ConnectionEvent, ConnectionManager, DeviceConnection,
};
use crate::discovery::{DiscoveredDevice, DiscoveryEvent, DiscoveryService, DiscoveryTiming};
use crate::pairing::{PairingError, PairingEvent, PairingManager, PairingRequest};
use crate::router::PacketRouter;
use crate::tlsconfig::TlsIdentity;

/// Errors surfaced from orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Discovery(#[from] crate::discovery::DiscoveryError),

    /// The device is neither connected nor currently discovered.
    #[error("unknown device: {0}")]
    UnknownDevice(String),
}

/// The daemon's integration hub. Construct with [`Orchestrator::new`],
/// then drive with [`Orchestrator::run`].
pub struct Orchestrator {
    discovery: Mutex<DiscoveryService>,
    connections: Arc<ConnectionManager>,
    pairing: Arc<PairingManager>,
    router: Arc<PacketRouter>,
    lifecycle: Arc<StdMutex<LifecycleMachine>>,
    discovery_port: u16,
    /// Last address each device connected from, for reconnection probing.
    last_addr: StdMutex<HashMap<String, SocketAddr>>,
    discovery_rx: Mutex<mpsc::Receiver<DiscoveryEvent>>,
    connection_rx: Mutex<mpsc::Receiver<ConnectionEvent>>,
    pairing_rx: Mutex<mpsc::Receiver<PairingEvent>>,
}

impl Orchestrator {
    /// Builds all services from the configuration, binds the session
    /// listener (so the announced identity carries the real TCP port), and
    /// registers the pairing handler on the router.
    pub async fn new(
        config: &DaemonConfig,
        tls: Arc<TlsIdentity>,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let identity = IdentityInfo {
            device_id: config.device.id.clone(),
            device_name: config.device.name.clone(),
            device_type: DeviceType::parse(&config.device.device_type)
                .unwrap_or(DeviceType::Desktop),
            protocol_version: PROTOCOL_VERSION,
            tcp_port: None,
            incoming_capabilities: vec![],
            outgoing_capabilities: vec![],
        };

        let router = Arc::new(PacketRouter::new());
        let (connections, connection_rx) = ConnectionManager::new(
            identity.clone(),
            tls.clone(),
            Arc::clone(&router),
            config.network.identity_timeout(),
        );
        connections
            .start_listener(config.network.tcp_port_start, config.network.tcp_port_end)
            .await?;

        let (pairing, pairing_rx) = PairingManager::new(
            &config.tls.trust_dir,
            tls.certificate_pem.clone(),
            config.network.pairing_timeout(),
        )?;

        // Discovery announces the post-bind identity, TCP port included.
        let timing = DiscoveryTiming {
            broadcast_interval: config.network.broadcast_interval(),
            sweep_interval: config.network.sweep_interval(),
            device_timeout: config.network.device_timeout(),
        };
        let (discovery, discovery_rx) =
            DiscoveryService::new(connections.identity(), config.network.discovery_port, timing);

        let pairing_handler = Arc::clone(&pairing);
        router.register(PACKET_TYPE_PAIR, move |packet, conn| {
            let pairing = Arc::clone(&pairing_handler);
            let packet = packet.clone();
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                pairing.handle_pair_packet(&packet, &conn).await;
            });
        });

        let lifecycle = Arc::new(StdMutex::new(LifecycleMachine::new()));

        Ok(Arc::new(Self {
            discovery: Mutex::new(discovery),
            connections,
            pairing,
            router,
            lifecycle,
            discovery_port: config.network.discovery_port,
            last_addr: StdMutex::new(HashMap::new()),
            discovery_rx: Mutex::new(discovery_rx),
            connection_rx: Mutex::new(connection_rx),
            pairing_rx: Mutex::new(pairing_rx),
        }))
    }

    /// Starts discovery and drives the event loop until `shutdown`
    /// resolves (typically a ctrl-c future).
    pub async fn run(
        self: &Arc<Self>,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), OrchestratorError> {
        self.try_transition(LinkState::Disconnected, ContextPatch::default());
        self.discovery.lock().await.start().await?;
        self.try_transition(LinkState::Discovering, ContextPatch::default());

        let mut discovery_rx = self.discovery_rx.lock().await;
        let mut connection_rx = self.connection_rx.lock().await;
        let mut pairing_rx = self.pairing_rx.lock().await;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = discovery_rx.recv() => self.on_discovery(event).await,
                Some(event) = connection_rx.recv() => self.on_connection(event).await,
                Some(event) = pairing_rx.recv() => self.on_pairing(event).await,
            }
        }

        info!("shutting down");
        self.discovery.lock().await.stop().await;
        self.pairing.shutdown();
        self.connections.shutdown().await;
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .destroy();
        Ok(())
    }

    async fn on_discovery(self: &Arc<Self>, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Found(device) => {
                let device_id = device.identity.device_id.clone();
                if !self.pairing.is_paired(&device_id) {
                    debug!("discovered unpaired device {device_id}, not dialing");
                    return;
                }
                if self.connections.get_connection(&device_id).is_some() {
                    return;
                }
                info!("auto-dialing paired device {device_id}");
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.connections.connect(&device).await {
                        warn!("auto-dial of {device_id} failed: {e}");
                    }
                });
            }
            DiscoveryEvent::Lost(device_id) => {
                debug!("device no longer announcing: {device_id}");
            }
        }
    }

    async fn on_connection(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(conn) => {
                if let Some(addr) = conn.address() {
                    self.last_addr
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(conn.device_id().to_string(), addr);
                }
                if self.pairing.is_paired(conn.device_id()) {
                    self.try_transition(
                        LinkState::Connected,
                        ContextPatch::device(conn.device_id(), conn.device_name()),
                    );
                } else {
                    // Session is up but untrusted; the pairing flow decides
                    // where the lifecycle goes next.
                    debug!("session with unpaired {} established", conn.device_id());
                }
            }
            ConnectionEvent::Disconnected { device_id } => {
                self.pairing.cancel_pending(&device_id);
                self.try_transition(LinkState::Disconnected, ContextPatch::default());
                self.try_transition(LinkState::Discovering, ContextPatch::default());

                // Nudge the device directly instead of waiting out its next
                // broadcast interval.
                let probe = self
                    .last_addr
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&device_id)
                    .copied();
                if let Some(addr) = probe {
                    // Probe the protocol's discovery port on the peer's
                    // address, not the session's ephemeral source port.
                    let discovery_addr = SocketAddr::new(addr.ip(), self.discovery_port);
                    let orchestrator = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = orchestrator
                            .discovery
                            .lock()
                            .await
                            .announce_to(discovery_addr)
                            .await
                        {
                            debug!("reconnect probe to {discovery_addr} failed: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn on_pairing(self: &Arc<Self>, event: PairingEvent) {
        match event {
            PairingEvent::Incoming(request) => {
                info!(
                    "pairing requested by {} ({}), verification key {}",
                    request.device_name, request.device_id, request.verification_key
                );
                self.try_transition(
                    LinkState::Pairing,
                    ContextPatch::device(&request.device_id, &request.device_name),
                );
            }
            PairingEvent::Result {
                device_id,
                success,
                message,
            } => {
                if success {
                    let name = self
                        .connections
                        .get_connection(&device_id)
                        .map(|c| c.device_name().to_string())
                        .unwrap_or_default();
                    self.try_transition(
                        LinkState::Connected,
                        ContextPatch::device(&device_id, &name),
                    );
                } else {
                    info!(
                        "pairing with {device_id} failed: {}",
                        message.as_deref().unwrap_or("no reason given")
                    );
                    if self.state() == LinkState::Pairing {
                        self.try_transition(LinkState::Disconnected, ContextPatch::default());
                        self.try_transition(LinkState::Discovering, ContextPatch::default());
                    }
                }
            }
            PairingEvent::Unpaired { device_id } => {
                if let Err(e) = self.connections.disconnect(&device_id).await {
                    debug!("no session to close for unpaired {device_id}: {e}");
                }
            }
        }
    }

    // ── Public surface for the presentation layer ─────────────────────────────

    /// Dials a device (if needed) and starts the outgoing pairing flow.
    /// Returns the verification key to display.
    pub async fn request_pairing(
        self: &Arc<Self>,
        device_id: &str,
    ) -> Result<String, OrchestratorError> {
        let conn = match self.connections.get_connection(device_id) {
            Some(conn) => conn,
            None => {
                let device = self
                    .discovery
                    .lock()
                    .await
                    .get(device_id)
                    .await
                    .ok_or_else(|| OrchestratorError::UnknownDevice(device_id.to_string()))?;
                self.connections.connect(&device).await?
            }
        };
        self.try_transition(
            LinkState::Pairing,
            ContextPatch::device(conn.device_id(), conn.device_name()),
        );
        Ok(self.pairing.request_pairing(conn).await?)
    }

    /// Accepts a pending incoming pairing request.
    pub async fn accept_pairing(&self, device_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.pairing.accept(device_id).await?)
    }

    /// Rejects a pending incoming pairing request.
    pub async fn reject_pairing(&self, device_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.pairing.reject(device_id).await?)
    }

    /// Revokes trust and closes any live session with the device.
    pub async fn unpair(&self, device_id: &str) -> Result<(), OrchestratorError> {
        let conn = self.connections.get_connection(device_id);
        Ok(self.pairing.unpair(device_id, conn).await?)
    }

    pub fn is_paired(&self, device_id: &str) -> bool {
        self.pairing.is_paired(device_id)
    }

    pub fn get_connection(&self, device_id: &str) -> Option<Arc<DeviceConnection>> {
        self.connections.get_connection(device_id)
    }

    pub fn connected_devices(&self) -> Vec<ConnectedDeviceInfo> {
        self.connections.connected_devices()
    }

    pub async fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.discovery.lock().await.devices().await
    }

    pub fn pending_pairing_request(&self, device_id: &str) -> Option<PairingRequest> {
        self.pairing.pending_request(device_id)
    }

    /// Registers a feature-layer handler for a packet type.
    pub fn register_handler<F>(&self, packet_type: &str, handler: F)
    where
        F: Fn(&devicelink_core::protocol::NetworkPacket, &Arc<DeviceConnection>)
            + Send
            + Sync
            + 'static,
    {
        self.router.register(packet_type, handler);
    }

    pub fn state(&self) -> LinkState {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state()
    }

    pub fn context(&self) -> StateContext {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .context()
    }

    pub fn history(&self, limit: usize) -> Vec<TransitionRecord> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history(limit)
    }

    /// Registers a lifecycle listener; returns its id.
    pub fn on_transition(&self, listener: impl Fn(&StateContext) + Send + 'static) -> u64 {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_transition(listener)
    }

    /// Attempts a transition, logging instead of failing when the table
    /// forbids it. Event timing makes some transitions arrive after the
    /// machine has already moved on; those are expected and harmless.
    fn try_transition(&self, to: LinkState, patch: ContextPatch) {
        let mut machine = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match machine.transition(to, patch) {
            Ok(context) => debug!("lifecycle: now {:?}", context.state),
            Err(e) => debug!("lifecycle: skipped transition ({e})"),
        }
    }
}
