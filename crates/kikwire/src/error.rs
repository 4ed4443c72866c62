//! Error types for the client core, plus the unified [`KikError`].

use std::time::Duration;

use kikwire_protocol::{CorrelationId, ProtocolError};
use kikwire_session::SessionError;
use kikwire_transport::TransportError;

use crate::ConnectionPhase;

/// Why a request never produced a reply stanza.
///
/// Delivered through the request's reply channel, so it is `Clone`: one
/// reset fans out to every outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The connection was torn down (node change, disconnect, transport
    /// failure) before the reply arrived.
    #[error("connection reset before a reply arrived")]
    ConnectionReset,

    /// No reply within the configured request timeout.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The server answered with `type="error"`.
    #[error("server error {code:?}: {text}")]
    Server { code: Option<u16>, text: String },

    /// The client has no connection to send on.
    #[error("not connected")]
    NotConnected,

    /// Another request with this id is still outstanding.
    #[error("request id {0} is already pending")]
    DuplicateId(CorrelationId),
}

/// Misuse of the client, or a handshake the server refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The operation is only valid in another phase.
    #[error("operation needs phase {expected}, client is in {actual}")]
    InvalidPhase {
        expected: ConnectionPhase,
        actual: ConnectionPhase,
    },

    /// The connection task has stopped.
    #[error("client task has shut down")]
    ClientClosed,

    /// `connect()` was called while a connection is already open.
    #[error("already connected")]
    AlreadyConnected,

    /// The server refused the authenticated stream header.
    #[error("authentication rejected by server")]
    AuthRejected,

    /// The server refused node discovery for a reason other than a
    /// captcha.
    #[error("node discovery rejected ({code:?}): {text}")]
    DiscoveryRejected { code: Option<u16>, text: String },
}

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates a `From` impl, so
/// the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum KikError {
    /// A transport-level error (connect, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (malformed or oversized stream).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-store error (load, save).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A single request failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Client misuse or handshake refusal.
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let kik_err: KikError = err.into();
        assert!(matches!(kik_err, KikError::Transport(_)));
        assert!(kik_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let kik_err: KikError = ProtocolError::Oversized(10).into();
        assert!(matches!(kik_err, KikError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let kik_err: KikError = SessionError::InvalidAccount(String::new()).into();
        assert!(matches!(kik_err, KikError::Session(_)));
    }

    #[test]
    fn test_from_request_error_keeps_message() {
        let kik_err: KikError = RequestError::Server {
            code: Some(404),
            text: "no such group".into(),
        }
        .into();
        assert!(matches!(kik_err, KikError::Request(_)));
        assert!(kik_err.to_string().contains("no such group"));
    }

    #[test]
    fn test_invalid_phase_names_both_phases() {
        let err = ClientError::InvalidPhase {
            expected: ConnectionPhase::AwaitingCaptcha,
            actual: ConnectionPhase::Authenticated,
        };
        let shown = err.to_string();
        assert!(shown.contains("awaiting-captcha"));
        assert!(shown.contains("authenticated"));
    }
}
