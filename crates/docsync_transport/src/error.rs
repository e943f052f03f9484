//! Error and close-status types for the transport.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// WebSocket close codes used by the transport.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (shutdown, app suspended).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error, including a bad upgrade response.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Connection dropped without a close handshake.
    pub const ABNORMAL: u16 = 1006;
    /// Policy violation.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Unexpected condition on the peer.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Network-level failures detected by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    /// Host name resolution failed.
    DnsFailure,
    /// Host name resolved to no addresses.
    UnknownHost,
    /// No route to the host.
    HostUnreachable,
    /// The local network is down.
    NetworkDown,
    /// Connect or handshake timed out.
    Timeout,
    /// TLS negotiation failed.
    TlsHandshakeFailed,
    /// Server certificate chain is not trusted.
    TlsCertUntrusted,
    /// Server certificate does not cover the host name.
    TlsCertNameMismatch,
    /// Server certificate differs from the pinned one.
    PinnedCertMismatch,
    /// Redirect chain exceeded the hop limit.
    TooManyRedirects,
    /// Redirect without a usable `Location`.
    InvalidRedirect,
    /// Target URL cannot be connected to.
    InvalidUrl,
    /// HTTP proxy refused the tunnel.
    ProxyFailed,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NetworkErrorKind::DnsFailure => "DNS lookup failed",
            NetworkErrorKind::UnknownHost => "unknown host",
            NetworkErrorKind::HostUnreachable => "host unreachable",
            NetworkErrorKind::NetworkDown => "network down",
            NetworkErrorKind::Timeout => "timed out",
            NetworkErrorKind::TlsHandshakeFailed => "TLS handshake failed",
            NetworkErrorKind::TlsCertUntrusted => "untrusted server certificate",
            NetworkErrorKind::TlsCertNameMismatch => "server certificate name mismatch",
            NetworkErrorKind::PinnedCertMismatch => "server certificate does not match pin",
            NetworkErrorKind::TooManyRedirects => "too many redirects",
            NetworkErrorKind::InvalidRedirect => "invalid redirect",
            NetworkErrorKind::InvalidUrl => "invalid URL",
            NetworkErrorKind::ProxyFailed => "proxy tunnel failed",
        };
        f.write_str(text)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Closed on request, or the peer ended the stream cleanly.
    Normal,
    /// WebSocket close code.
    WebSocket(u16),
    /// HTTP status returned instead of an upgrade.
    Http(u16),
    /// Socket-level I/O failure.
    Io(io::ErrorKind),
    /// Network failure detected by the transport.
    Network(NetworkErrorKind),
}

/// The single terminal status reported when a connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// Reason category and code.
    pub kind: CloseKind,
    /// Human-readable detail.
    pub message: String,
}

impl CloseStatus {
    /// Creates a close status.
    pub fn new(kind: CloseKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Normal closure.
    pub fn normal() -> Self {
        Self::new(CloseKind::Normal, "")
    }

    /// Closure with a WebSocket close code.
    pub fn websocket(code: u16, message: impl Into<String>) -> Self {
        if code == close_code::NORMAL {
            return Self::new(CloseKind::Normal, message);
        }
        Self::new(CloseKind::WebSocket(code), message)
    }

    /// Returns true for a normal closure.
    pub fn is_normal(&self) -> bool {
        self.kind == CloseKind::Normal
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CloseKind::Normal => write!(f, "closed normally")?,
            CloseKind::WebSocket(code) => write!(f, "WebSocket close {code}")?,
            CloseKind::Http(status) => write!(f, "HTTP {status}")?,
            CloseKind::Io(kind) => write!(f, "I/O error ({kind:?})")?,
            CloseKind::Network(kind) => write!(f, "{kind}")?,
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// Errors that can occur in the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Network failure detected by the transport.
    #[error("{kind}: {message}")]
    Network {
        /// Failure category.
        kind: NetworkErrorKind,
        /// Detail.
        message: String,
    },

    /// Server answered the upgrade with an HTTP error status.
    #[error("HTTP {status} {reason}")]
    Http {
        /// Status code.
        status: u16,
        /// Reason phrase.
        reason: String,
    },

    /// Upgrade response violated the WebSocket handshake.
    #[error("handshake protocol error: {0}")]
    Protocol(String),

    /// No live connection has this ID.
    #[error("unknown connection")]
    UnknownConnection,

    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Creates a network error.
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    /// Converts the error into the status reported with `Closed`.
    pub fn close_status(&self) -> CloseStatus {
        match self {
            TransportError::Io(err) => CloseStatus::new(CloseKind::Io(err.kind()), err.to_string()),
            TransportError::Network { kind, message } => {
                CloseStatus::new(CloseKind::Network(*kind), message.clone())
            }
            TransportError::Http { status, reason } => {
                CloseStatus::new(CloseKind::Http(*status), reason.clone())
            }
            TransportError::Protocol(message) => {
                CloseStatus::websocket(close_code::PROTOCOL_ERROR, message.clone())
            }
            TransportError::UnknownConnection | TransportError::Closed => CloseStatus::normal(),
        }
    }
}
