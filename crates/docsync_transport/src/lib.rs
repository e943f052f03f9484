//! # docsync Transport
//!
//! Byte-stream transport for docsync replication sessions.
//!
//! This crate provides:
//! - The HTTP/1.1 WebSocket upgrade handshake, including redirects,
//!   auth challenges and cookies
//! - TCP connection setup, HTTP `CONNECT` proxies and TLS (default chain
//!   validation or a pinned certificate)
//! - A per-connection control queue with independent read and write loops
//! - Receive backpressure driven by consumer acknowledgements
//! - A registry of live connections keyed by [`ConnectionId`]
//!
//! WebSocket frame parsing is not done here: after the upgrade the
//! connection carries raw bytes for the frame layer above it.
//!
//! ## Architecture
//!
//! ```text
//!   TransportManager ──open/send/close──▶ control queue (one task, FIFO)
//!                                          │        ▲
//!                               frames ◀───┘        │ Received / WriteCompleted
//!                                 │                 │
//!                             write loop        read loop ◀── receive gate
//!                                 │                 │
//!                                 └──── socket ─────┘
//! ```
//!
//! ## Key Invariants
//!
//! - Frames reach the wire in the order they were sent
//! - Once unacknowledged received bytes reach the high-water mark, the
//!   socket is not read again until the consumer acknowledges enough bytes
//! - Every connection emits exactly one terminal `Closed` event
//! - Only the control queue changes connection state; the loops report to it

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod error;
mod handshake;
mod registry;
mod stream;
mod tls;

pub use config::{ConnectionOptions, Credentials, ProxyConfig, TransportConfig};
pub use connection::{ConnectionEvent, TransportEvent};
pub use error::{
    close_code, CloseKind, CloseStatus, NetworkErrorKind, TransportError, TransportResult,
};
pub use handshake::{
    accept_key, connect_request, generate_nonce, parse_set_cookie, HandshakeOutcome, HttpLogic,
    HttpResponse, MAX_REDIRECTS, WEBSOCKET_GUID,
};
pub use registry::{ConnectionId, ConnectionRegistry, TransportManager};
pub use stream::{AsyncStream, BoxFuture, BoxedStream, Connector, TcpConnector};
