//! In-process transport backed by Tokio channels.
//!
//! Every `connect()` creates a fresh pair of unbounded channels. The
//! client side is returned as a [`ChannelConnection`]; the other side is
//! handed to whoever holds the [`ChannelServer`] as a [`PeerConnection`].
//! Dropping either side closes the stream for the other one, just like a
//! socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::{Connection, ConnectionId, Connector, TransportError};

type Bytes = Vec<u8>;

/// A [`Connector`] whose connections terminate in the same process.
#[derive(Clone)]
pub struct ChannelConnector {
    accept_tx: mpsc::UnboundedSender<PeerConnection>,
    refuse: Arc<AtomicBool>,
}

/// The accepting end paired with a [`ChannelConnector`].
pub struct ChannelServer {
    accept_rx: mpsc::UnboundedReceiver<PeerConnection>,
}

impl ChannelConnector {
    /// Creates a connector and the server end that receives its
    /// connections.
    pub fn new() -> (Self, ChannelServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse: Arc::new(AtomicBool::new(false)),
            },
            ChannelServer { accept_rx },
        )
    }

    /// Makes subsequent `connect()` calls fail until switched back.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl ChannelServer {
    /// Waits for the next connection opened by the paired connector.
    ///
    /// Returns `None` once every connector clone has been dropped.
    pub async fn accept(&mut self) -> Option<PeerConnection> {
        self.accept_rx.recv().await
    }
}

impl Connector for ChannelConnector {
    type Connection = ChannelConnection;
    type Error = TransportError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                addr: "channel".into(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connector is refusing connections",
                ),
            });
        }

        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let id = ConnectionId::next();

        let peer = PeerConnection {
            id,
            incoming: Mutex::new(to_peer_rx),
            outgoing: to_client_tx,
        };
        self.accept_tx.send(peer).map_err(|_| {
            TransportError::ConnectionClosed("channel server dropped".into())
        })?;

        tracing::debug!(%id, "channel connection established");
        Ok(ChannelConnection {
            id,
            incoming: Mutex::new(to_client_rx),
            outgoing: to_peer_tx,
            closed: AtomicBool::new(false),
        })
    }
}

/// Client side of an in-process connection.
pub struct ChannelConnection {
    id: ConnectionId,
    incoming: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
}

impl Connection for ChannelConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed(
                "closed locally".into(),
            ));
        }
        self.outgoing.send(data.to_vec()).map_err(|_| {
            TransportError::ConnectionClosed("peer dropped".into())
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.incoming.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Server side of an in-process connection.
///
/// `recv` yields exactly the byte chunks the client sent; `send` delivers
/// one chunk to the client's next `recv`.
pub struct PeerConnection {
    id: ConnectionId,
    incoming: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outgoing: mpsc::UnboundedSender<Bytes>,
}

impl PeerConnection {
    /// The id shared with the client side of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Receives the next chunk the client sent. `None` once the client
    /// side has been dropped.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.incoming.lock().await.recv().await
    }

    /// Sends a chunk to the client.
    pub fn send(&self, data: impl AsRef<[u8]>) -> Result<(), TransportError> {
        self.outgoing.send(data.as_ref().to_vec()).map_err(|_| {
            TransportError::ConnectionClosed("client dropped".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_hands_peer_to_server() {
        let (connector, mut server) = ChannelConnector::new();

        let client = connector.connect().await.expect("should connect");
        let peer = server.accept().await.expect("peer should arrive");

        assert_eq!(client.id(), peer.id());
    }

    #[tokio::test]
    async fn test_bytes_flow_both_directions() {
        let (connector, mut server) = ChannelConnector::new();
        let client = connector.connect().await.unwrap();
        let peer = server.accept().await.unwrap();

        client.send(b"<k anon=\"\">").await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), b"<k anon=\"\">".to_vec());

        peer.send(b"<k ok=\"1\">").unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Some(b"<k ok=\"1\">".to_vec())
        );
    }

    #[tokio::test]
    async fn test_dropping_client_closes_peer_stream() {
        let (connector, mut server) = ChannelConnector::new();
        let client = connector.connect().await.unwrap();
        let peer = server.accept().await.unwrap();

        drop(client);

        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropping_peer_ends_client_recv() {
        let (connector, mut server) = ChannelConnector::new();
        let client = connector.connect().await.unwrap();
        let peer = server.accept().await.unwrap();

        drop(peer);

        assert_eq!(client.recv().await.unwrap(), None);
        assert!(client.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (connector, _server) = ChannelConnector::new();
        let client = connector.connect().await.unwrap();

        client.close().await.unwrap();

        assert!(matches!(
            client.send(b"x").await,
            Err(TransportError::ConnectionClosed(_))
        ));
        assert_eq!(client.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refusing_connector_fails_connect() {
        let (connector, _server) = ChannelConnector::new();
        connector.set_refuse(true);

        let result = connector.connect().await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectFailed { .. })
        ));

        connector.set_refuse(false);
        assert!(connector.connect().await.is_ok());
    }
}
