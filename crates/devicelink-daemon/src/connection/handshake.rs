//! The plaintext-then-TLS role-inversion handshake.
//!
//! The protocol inverts the usual TCP/TLS role mapping. Whichever side
//! *dials* TCP speaks first in plaintext and then becomes the TLS
//! **server**; the side that *accepted* the TCP connection becomes the TLS
//! **client**:
//!
//! ```text
//! dialer                          listener
//! ──────                          ────────
//! TCP connect ─────────────────►  accept
//! identity (plaintext) ────────►  read one line, stop at the delimiter
//! TLS accept (server)  ◄───────►  TLS connect (client)
//! identity (inside TLS) ───────►            (protocol version >= 8 only)
//!                       ◄───────  identity (inside TLS)
//! ```
//!
//! Four distinct paths fall out of direction x protocol version
//! (outbound/inbound, legacy/secure-identity); each is an explicit step
//! sequence here rather than nested conditionals so the timeout and
//! replay-buffer handling stays auditable.
//!
//! Two delicate points:
//! - The listener must never read past the plaintext identity's newline,
//!   because the next bytes on the socket are the peer's TLS ClientHello.
//!   The plaintext line is therefore read one byte at a time.
//! - Inside TLS, any bytes following the identity line in the same read
//!   belong to the application stream and are returned as `leftover` for
//!   the caller to replay into the packet router.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsStream;
use tracing::{debug, warn};

use devicelink_core::protocol::{codec, IdentityInfo, MIN_VERSION_SECURE_IDENTITY};

use crate::connection::{ConnectionError, SessionTransport};
use crate::tlsconfig::{peer_certificate_pem, TlsIdentity};

/// Longest accepted identity line, plaintext or encrypted. An
/// unauthenticated peer that streams an endless unterminated line is cut
/// off here instead of exhausting memory.
const MAX_IDENTITY_LINE: usize = 1 << 16;

/// Result of a completed handshake, either direction.
pub struct HandshakeOutcome {
    /// The peer identity confirmed inside TLS (or, on the legacy path,
    /// the identity asserted before the upgrade).
    pub identity: IdentityInfo,
    /// The established encrypted stream. Boxed so the registration path
    /// can also be driven over in-memory transports.
    pub stream: Box<dyn SessionTransport>,
    /// Application bytes that arrived in the same read as the identity
    /// line. Must be replayed to the connection's data consumer.
    pub leftover: Vec<u8>,
    /// The peer's leaf certificate, PEM-encoded.
    pub peer_cert_pem: Option<String>,
}

/// Outbound handshake: we dialed `stream`, `announced` is what discovery
/// told us about the peer (absent for direct-IP dials).
pub async fn outbound(
    mut stream: TcpStream,
    our_identity: &IdentityInfo,
    announced: Option<&IdentityInfo>,
    tls: &TlsIdentity,
    identity_timeout: Duration,
) -> Result<HandshakeOutcome, ConnectionError> {
    // Step 1: assert our identity in plaintext, then stop talking — the
    // peer's next bytes are its TLS ClientHello.
    let line = codec::encode(&our_identity.to_packet()).map_err(ConnectionError::Protocol)?;
    stream.write_all(line.as_bytes()).await?;

    // Step 2: role inversion — the dialer is the TLS server. Bounded: a
    // peer that never sends its ClientHello must not hang the attempt.
    let accepted = tokio::time::timeout(identity_timeout, tls.acceptor().accept(stream))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)??;
    let tls_stream = TlsStream::Server(accepted);

    // Step 3: confirm identities inside the channel when the peer is new
    // enough. With no announcement to consult (direct-IP dial) the secure
    // exchange is mandatory: it is the only way to learn who we reached.
    let announced_version = announced.map(|a| a.protocol_version);
    secure_exchange(
        tls_stream,
        our_identity,
        announced,
        announced_version,
        identity_timeout,
    )
    .await
}

/// First inbound stage: the peer dialed us and speaks first. Reads and
/// validates exactly one plaintext identity line, leaving the socket
/// positioned at the peer's first TLS byte.
///
/// Split from [`inbound_upgrade`] so the connection manager can reject a
/// duplicate handshake for the identifier before any TLS work happens.
pub async fn inbound_identity(
    stream: &mut TcpStream,
    identity_timeout: Duration,
) -> Result<IdentityInfo, ConnectionError> {
    let line = tokio::time::timeout(identity_timeout, read_plaintext_line(stream))
        .await
        .map_err(|_| ConnectionError::IdentityTimeout)??;
    let packet = codec::decode(&line).map_err(ConnectionError::Protocol)?;
    IdentityInfo::from_packet(&packet).map_err(ConnectionError::InvalidIdentity)
}

/// Second inbound stage: TLS upgrade in the *client* role (role inversion)
/// followed by the in-channel identity exchange.
pub async fn inbound_upgrade(
    stream: TcpStream,
    peer_addr: SocketAddr,
    plaintext_identity: IdentityInfo,
    our_identity: &IdentityInfo,
    tls: &TlsIdentity,
    identity_timeout: Duration,
) -> Result<HandshakeOutcome, ConnectionError> {
    let server_name = ServerName::IpAddress(peer_addr.ip().into());
    let connected = tokio::time::timeout(
        identity_timeout,
        tls.connector().connect(server_name, stream),
    )
    .await
    .map_err(|_| ConnectionError::HandshakeTimeout)??;
    let tls_stream = TlsStream::Client(connected);

    let version = plaintext_identity.protocol_version;
    secure_exchange(
        tls_stream,
        our_identity,
        Some(&plaintext_identity),
        Some(version),
        identity_timeout,
    )
    .await
}

/// Step 4 shared by both directions: re-exchange identity inside TLS when
/// the peer's protocol version requires it, otherwise fall back to the
/// pre-upgrade identity (legacy compatibility path — that identity was
/// never confirmed over the authenticated channel).
async fn secure_exchange(
    mut tls_stream: TlsStream<TcpStream>,
    our_identity: &IdentityInfo,
    prior: Option<&IdentityInfo>,
    peer_version: Option<i64>,
    identity_timeout: Duration,
) -> Result<HandshakeOutcome, ConnectionError> {
    let needs_secure_identity =
        peer_version.map_or(true, |v| v >= MIN_VERSION_SECURE_IDENTITY);

    if !needs_secure_identity {
        let identity = prior.cloned().ok_or(ConnectionError::IdentityTimeout)?;
        debug!(
            "legacy peer {} (v{}): identity not re-confirmed inside TLS",
            identity.device_id, identity.protocol_version
        );
        let peer_cert_pem = peer_certificate_pem(&tls_stream);
        return Ok(HandshakeOutcome {
            identity,
            stream: Box::new(tls_stream),
            leftover: Vec::new(),
            peer_cert_pem,
        });
    }

    let line = codec::encode(&our_identity.to_packet()).map_err(ConnectionError::Protocol)?;
    tls_stream.write_all(line.as_bytes()).await?;

    let (identity_line, leftover) =
        tokio::time::timeout(identity_timeout, read_encrypted_line(&mut tls_stream))
            .await
            .map_err(|_| ConnectionError::IdentityTimeout)??;
    let packet = codec::decode(&identity_line).map_err(ConnectionError::Protocol)?;
    let identity = IdentityInfo::from_packet(&packet).map_err(ConnectionError::InvalidIdentity)?;

    // Trust anomaly, not a session abort: the pre-upgrade assertion and the
    // authenticated assertion disagree. The pairing layer still gates trust
    // on the presented certificate.
    if let Some(prior) = prior {
        if prior.device_id != identity.device_id {
            warn!(
                "identity mismatch: {} asserted before TLS, {} inside TLS",
                prior.device_id, identity.device_id
            );
        }
    }

    let peer_cert_pem = peer_certificate_pem(&tls_stream);
    Ok(HandshakeOutcome {
        identity,
        stream: Box::new(tls_stream),
        leftover,
        peer_cert_pem,
    })
}

/// Reads one newline-terminated line without consuming any byte past the
/// delimiter. Used only on the plaintext side of the handshake, where the
/// bytes after the delimiter are the start of the TLS handshake.
async fn read_plaintext_line(stream: &mut TcpStream) -> Result<String, ConnectionError> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        line.push(byte);
        if line.len() > MAX_IDENTITY_LINE {
            return Err(ConnectionError::IdentityTooLong);
        }
    }
}

/// Reads one newline-terminated line from the encrypted stream, returning
/// the line and any extra bytes read past the delimiter (application data
/// to be replayed).
async fn read_encrypted_line(
    stream: &mut TlsStream<TcpStream>,
) -> Result<(String, Vec<u8>), ConnectionError> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during identity exchange",
            )));
        }
        collected.extend_from_slice(&buf[..n]);
        if let Some(pos) = collected.iter().position(|&b| b == b'\n') {
            let leftover = collected.split_off(pos + 1);
            collected.pop(); // drop the delimiter
            return Ok((String::from_utf8_lossy(&collected).into_owned(), leftover));
        }
        if collected.len() > MAX_IDENTITY_LINE {
            return Err(ConnectionError::IdentityTooLong);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
