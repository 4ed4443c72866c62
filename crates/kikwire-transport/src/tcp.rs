//! TCP transport implementation, with optional TLS via `tokio-rustls`.

use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::{Connection, ConnectionId, Connector, TransportError};

/// Size of the buffer handed to each `read` call.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Address of the production chat endpoint.
pub const DEFAULT_ADDR: &str = "talk1110an.kik.com:5223";

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A [`Connector`] that dials a TCP endpoint, optionally upgrading the
/// stream to TLS.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    tls_domain: Option<String>,
}

impl TcpConnector {
    /// Creates a connector for the given `host:port` address (plain TCP).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls_domain: None,
        }
    }

    /// Enables TLS, verifying the server certificate against `domain`.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, domain: impl Into<String>) -> Self {
        self.tls_domain = Some(domain.into());
        self
    }

    /// Returns the address this connector dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn open_stream(
        &self,
    ) -> Result<(BoxedReader, BoxedWriter), TransportError> {
        let tcp = TcpStream::connect(&self.addr).await.map_err(|source| {
            TransportError::ConnectFailed {
                addr: self.addr.clone(),
                source,
            }
        })?;
        // Stanzas are small and latency-sensitive.
        let _ = tcp.set_nodelay(true);

        match &self.tls_domain {
            None => {
                let (r, w) = tokio::io::split(tcp);
                Ok((Box::pin(r), Box::pin(w)))
            }
            #[cfg(feature = "tls")]
            Some(domain) => {
                let tls = tls::handshake(tcp, domain, &self.addr).await?;
                let (r, w) = tokio::io::split(tls);
                Ok((Box::pin(r), Box::pin(w)))
            }
            #[cfg(not(feature = "tls"))]
            Some(domain) => Err(TransportError::InvalidServerName(format!(
                "{domain} (built without the `tls` feature)"
            ))),
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_ADDR)
    }
}

impl Connector for TcpConnector {
    type Connection = TcpConnection;
    type Error = TransportError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let (reader, writer) = self.open_stream().await?;
        let id = ConnectionId::next();
        tracing::debug!(
            %id,
            addr = %self.addr,
            tls = self.tls_domain.is_some(),
            "TCP connection established"
        );
        Ok(TcpConnection {
            id,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

/// A single TCP (or TLS-over-TCP) connection.
///
/// Read and write halves sit behind separate locks so a pending `recv`
/// never blocks a `send`.
pub struct TcpConnection {
    id: ConnectionId,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
}

impl Connection for TcpConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(TransportError::SendFailed)?;
        writer.flush().await.map_err(TransportError::SendFailed)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let n = self
            .reader
            .lock()
            .await
            .read(&mut buf)
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

#[cfg(feature = "tls")]
mod tls {
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    use crate::TransportError;

    pub(super) async fn handshake(
        tcp: TcpStream,
        domain: &str,
        addr: &str,
    ) -> Result<TlsStream<TcpStream>, TransportError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|_| TransportError::InvalidServerName(domain.into()))?;

        TlsConnector::from(Arc::new(config))
            .connect(server_name, tcp)
            .await
            .map_err(|source| TransportError::ConnectFailed {
                addr: addr.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connector_targets_production_endpoint() {
        let connector = TcpConnector::default();
        assert_eq!(connector.addr(), DEFAULT_ADDR);
        assert!(connector.tls_domain.is_none());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_returns_connect_failed() {
        // Bind then drop to get a port nobody is listening on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        drop(listener);

        let result = TcpConnector::new(addr.clone()).connect().await;
        assert!(
            matches!(result, Err(TransportError::ConnectFailed { addr: a, .. }) if a == addr)
        );
    }
}
