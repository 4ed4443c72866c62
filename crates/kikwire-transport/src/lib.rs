//! Transport abstraction layer for kikwire.
//!
//! Provides the [`Connector`] and [`Connection`] traits that abstract over
//! the byte stream the client talks to the chat server through. The
//! client core never touches sockets directly: it asks a connector for a
//! fresh connection whenever it needs one (first connect, or after the
//! server assigns a new routing node) and reads/writes raw bytes.
//!
//! # Feature Flags
//!
//! - `tcp` (default): plain TCP transport via `tokio::net::TcpStream`
//! - `tls`: wraps the TCP transport in TLS via `tokio-rustls`
//!
//! The in-process [`ChannelConnector`] is always available; it backs the
//! test suites and lets an application host a fake server in-process.

mod channel;
mod error;
#[cfg(feature = "tcp")]
mod tcp;

pub use channel::{ChannelConnection, ChannelConnector, ChannelServer, PeerConnection};
pub use error::TransportError;
#[cfg(feature = "tcp")]
pub use tcp::{TcpConnection, TcpConnector};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
///
/// Every transport instance gets a new one, so data that arrives from a
/// connection that has since been torn down can be told apart from data
/// on the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-wide unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opens new outbound connections.
///
/// The returned futures are `Send` so the client's connection actor can
/// be spawned on a multi-threaded runtime while staying generic over the
/// connector.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Connection: Connection;
    /// The error type for connect operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens a fresh connection to the server.
    fn connect(
        &self,
    ) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;
}

/// A single connection that can send and receive bytes.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends data to the remote peer.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Receives the next chunk of bytes from the remote peer.
    ///
    /// Chunks carry no framing guarantees: a stanza may be split across
    /// several chunks, or several stanzas may share one.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
