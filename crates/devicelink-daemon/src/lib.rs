//! # devicelink-daemon
//!
//! The desktop-side companion daemon: discovers a phone on the local
//! network, establishes a mutually authenticated TLS session with it, and
//! routes structured packets between the phone and feature layers.
//!
//! Module map:
//!
//! - **`config`** – TOML configuration with serde defaults and first-run
//!   generation.
//! - **`tlsconfig`** – rustls setup: certificate loading and the
//!   pairing-owns-trust verifiers.
//! - **`discovery`** – UDP presence broadcasts, the discovered-device
//!   registry, and staleness eviction.
//! - **`connection`** – the TCP listener, outbound dialing, the
//!   plaintext-then-TLS role-inversion handshake, and the live-session
//!   registry.
//! - **`pairing`** – the certificate trust store and the pair-packet
//!   exchange.
//! - **`router`** – newline-delimited packet framing and per-type handler
//!   dispatch.
//! - **`orchestrator`** – event-loop glue tying all of the above to the
//!   lifecycle state machine in `devicelink-core`.

pub mod config;
pub mod connection;
pub mod discovery;
pub mod orchestrator;
pub mod pairing;
pub mod router;
pub mod tlsconfig;
