//! The session/connection state machine.
//!
//! Decides what happens next in the connect → handshake → authenticated
//! lifecycle. It is pure: it never touches a socket or a store. Each
//! input returns a list of [`Action`]s that the connection task performs
//! in order.
//!
//! ```text
//!                 node persisted?
//!   Disconnected ──────yes──────→ Authenticating ──ok──→ Authenticated
//!        │                              ↑
//!        no                             │ (fresh transport)
//!        ↓                              │
//!   NodeDiscovery ──node issued──→ persist, reconnect
//!     │      ↑
//!  captcha   │ resolve_captcha
//!     ↓      │
//!   AwaitingCaptcha
//! ```

use std::fmt;

use kikwire_protocol::requests;
use kikwire_protocol::{Credentials, Inbound, Stanza};
use kikwire_session::Session;
use serde::{Deserialize, Serialize};

use crate::{ClientError, ClientEvent};

// ---------------------------------------------------------------------------
// ConnectionPhase
// ---------------------------------------------------------------------------

/// Where the current connection is in its lifecycle.
///
/// Exactly one phase is active at a time. A phase belongs to one
/// transport instance: rebuilding the transport restarts the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionPhase {
    /// No transport.
    Disconnected,
    /// Anonymous stream open; asking the server for a routing node.
    NodeDiscovery,
    /// Authenticated stream header sent; waiting for the server to accept
    /// it.
    Authenticating,
    /// Handshake complete.
    Authenticated,
    /// Node discovery is blocked on a captcha answer.
    AwaitingCaptcha,
}

impl ConnectionPhase {
    /// Returns `true` while a handshake is underway on a live transport.
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            Self::NodeDiscovery | Self::Authenticating | Self::AwaitingCaptcha
        )
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::NodeDiscovery => "node-discovery",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::AwaitingCaptcha => "awaiting-captcha",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// A side effect requested by the state machine.
#[derive(Debug, Clone)]
pub enum Action {
    /// Write a stanza. `restart_stream` marks a stream header: it is sent
    /// as a bare start tag and the inbound parser starts afresh.
    Send { stanza: Stanza, restart_stream: bool },
    /// Save the session to the store. Always precedes any
    /// [`Action::Reconnect`] in the same batch.
    Persist(Session),
    /// Tear down the transport and open a fresh one, then call
    /// [`StateMachine::transport_ready`].
    Reconnect,
    /// Tear down the transport and fail everything waiting on it.
    Disconnect,
    /// Broadcast an event.
    Emit(ClientEvent),
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// Owns the in-memory session and the current phase.
pub struct StateMachine {
    phase: ConnectionPhase,
    session: Session,
    credentials: Credentials,
}

impl StateMachine {
    /// A machine for `credentials`, starting from an already-loaded
    /// session.
    pub fn new(credentials: Credentials, session: Session) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            session,
            credentials,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// A fresh transport is open: start the handshake.
    ///
    /// With a persisted node this goes straight to `Authenticating`;
    /// without one it starts node discovery.
    pub fn transport_ready(&mut self) -> Vec<Action> {
        let (header, phase) = match self.session.node.as_deref() {
            Some(node) => (
                requests::auth_stream(&self.credentials, node, &self.session.device_id),
                ConnectionPhase::Authenticating,
            ),
            None => (
                requests::anonymous_stream(&self.session.device_id),
                ConnectionPhase::NodeDiscovery,
            ),
        };
        let mut actions = Vec::new();
        self.enter(phase, &mut actions);
        actions.push(Action::Send {
            stanza: header,
            restart_stream: true,
        });
        actions
    }

    /// The transport went away (or the caller asked to disconnect).
    ///
    /// Always asks for a teardown; emits `Disconnected` only if there was
    /// a live connection.
    pub fn transport_lost(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::Disconnect];
        if self.phase != ConnectionPhase::Disconnected {
            self.enter(ConnectionPhase::Disconnected, &mut actions);
            actions.push(Action::Emit(ClientEvent::Disconnected));
        }
        actions
    }

    /// Records a new routing node: persist the session, then rebuild the
    /// transport so the next handshake authenticates against the node.
    ///
    /// While disconnected the node is only persisted; the next
    /// `connect()` picks it up.
    pub fn set_node(&mut self, node: impl Into<String>) -> Vec<Action> {
        let node = node.into();
        tracing::info!(
            account = %self.credentials.username,
            %node,
            "routing node assigned"
        );
        self.session.node = Some(node);

        let mut actions = vec![Action::Persist(self.session.clone())];
        if self.phase != ConnectionPhase::Disconnected {
            actions.push(Action::Reconnect);
        }
        actions
    }

    /// Answers the pending captcha: resend node discovery with the
    /// response attached.
    ///
    /// # Errors
    /// [`ClientError::InvalidPhase`] unless the machine is in
    /// `AwaitingCaptcha`.
    pub fn resolve_captcha(&mut self, response: &str) -> Result<Vec<Action>, ClientError> {
        if self.phase != ConnectionPhase::AwaitingCaptcha {
            return Err(ClientError::InvalidPhase {
                expected: ConnectionPhase::AwaitingCaptcha,
                actual: self.phase,
            });
        }
        self.session.captcha_token = Some(response.to_string());

        let mut actions = Vec::new();
        self.enter(ConnectionPhase::NodeDiscovery, &mut actions);
        actions.push(Action::Send {
            stanza: self.discovery_request(Some(response)),
            restart_stream: false,
        });
        Ok(actions)
    }

    /// Reacts to one classified inbound frame.
    ///
    /// Handshake frames move the machine; everything else becomes exactly
    /// one broadcast event.
    pub fn handle(&mut self, inbound: Inbound) -> Vec<Action> {
        let mut actions = Vec::new();
        match inbound {
            Inbound::StreamOpened { ok, header } => self.on_stream_opened(ok, header, &mut actions),
            Inbound::StreamClosed => {
                tracing::info!(phase = %self.phase, "server closed the stream");
                return self.transport_lost();
            }
            Inbound::NodeIssued { node } => {
                if self.phase == ConnectionPhase::Disconnected {
                    tracing::debug!(%node, "node issued on a dead connection, ignoring");
                    return actions;
                }
                return self.set_node(node);
            }
            Inbound::CaptchaChallenge { url } => {
                tracing::info!(%url, "captcha required for node discovery");
                self.enter(ConnectionPhase::AwaitingCaptcha, &mut actions);
                actions.push(Action::Emit(ClientEvent::CaptchaChallenge { url }));
            }
            Inbound::RegisterRejected { code, text } => {
                tracing::warn!(?code, %text, "node discovery rejected");
                actions.push(Action::Emit(ClientEvent::error(
                    ClientError::DiscoveryRejected { code, text },
                )));
                actions.extend(self.transport_lost());
            }
            Inbound::Roster { groups, friends } => {
                actions.push(Action::Emit(ClientEvent::RosterReceived { groups, friends }));
            }
            Inbound::JidInfo { users } => {
                actions.push(Action::Emit(ClientEvent::JidInfoReceived { users }));
            }
            Inbound::UserLeftGroup { group, user } => {
                actions.push(Action::Emit(ClientEvent::UserLeftGroup { group, user }));
            }
            Inbound::Message(message) => {
                actions.push(Action::Emit(ClientEvent::MessageReceived(message)));
            }
            Inbound::Other(stanza) => {
                actions.push(Action::Emit(ClientEvent::Unhandled(stanza)));
            }
        }
        actions
    }

    fn on_stream_opened(&mut self, ok: bool, header: Stanza, actions: &mut Vec<Action>) {
        match (self.phase, ok) {
            (ConnectionPhase::NodeDiscovery, true) => {
                actions.push(Action::Send {
                    stanza: self.discovery_request(None),
                    restart_stream: false,
                });
            }
            (ConnectionPhase::Authenticating, true) => {
                self.enter(ConnectionPhase::Authenticated, actions);
                actions.push(Action::Emit(ClientEvent::Authenticated));
            }
            (ConnectionPhase::Authenticating | ConnectionPhase::NodeDiscovery, false) => {
                tracing::warn!(phase = %self.phase, "server rejected stream header");
                actions.push(Action::Emit(ClientEvent::error(ClientError::AuthRejected)));
                actions.extend(self.transport_lost());
            }
            _ => {
                tracing::debug!(phase = %self.phase, "unexpected stream header");
                actions.push(Action::Emit(ClientEvent::Unhandled(header)));
            }
        }
    }

    fn discovery_request(&self, captcha_response: Option<&str>) -> Stanza {
        requests::request_node(
            &self.credentials,
            &self.session.device_id,
            &self.session.android_id,
            captcha_response,
        )
        .stanza
    }

    fn enter(&mut self, next: ConnectionPhase, actions: &mut Vec<Action>) {
        if self.phase == next {
            return;
        }
        let from = self.phase;
        self.phase = next;
        tracing::info!(
            account = %self.credentials.username,
            %from,
            to = %next,
            "phase changed"
        );
        actions.push(Action::Emit(ClientEvent::PhaseChanged { from, to: next }));
    }
}

#[cfg(test)]
mod tests {
    use kikwire_protocol::{ChatMessage, Jid};

    use super::*;

    fn machine(node: Option<&str>) -> StateMachine {
        let mut session = Session::fresh();
        session.node = node.map(str::to_string);
        StateMachine::new(Credentials::new("alice", "pw"), session)
    }

    fn sent(actions: &[Action]) -> Vec<&Stanza> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { stanza, .. } => Some(stanza),
                _ => None,
            })
            .collect()
    }

    fn opened(ok: bool) -> Inbound {
        Inbound::StreamOpened {
            ok,
            header: Stanza::new("k").attr("ok", if ok { "1" } else { "0" }),
        }
    }

    #[test]
    fn test_transport_ready_without_node_starts_discovery() {
        let mut m = machine(None);
        let actions = m.transport_ready();

        assert_eq!(m.phase(), ConnectionPhase::NodeDiscovery);
        let stanzas = sent(&actions);
        assert_eq!(stanzas.len(), 1);
        assert_eq!(stanzas[0].name, "k");
        assert_eq!(stanzas[0].get_attr("anon"), Some(""));
        assert!(matches!(
            actions.last(),
            Some(Action::Send { restart_stream: true, .. })
        ));
    }

    #[test]
    fn test_transport_ready_with_node_authenticates_directly() {
        let mut m = machine(Some("node123@talk.kik.com"));
        let actions = m.transport_ready();

        assert_eq!(m.phase(), ConnectionPhase::Authenticating);
        let stanzas = sent(&actions);
        assert_eq!(stanzas.len(), 1);
        assert!(
            stanzas[0]
                .get_attr("from")
                .is_some_and(|f| f.starts_with("node123@talk.kik.com/"))
        );
        assert_eq!(stanzas[0].get_attr("anon"), None);
    }

    #[test]
    fn test_stream_opened_in_discovery_sends_node_request() {
        let mut m = machine(None);
        m.transport_ready();
        let actions = m.handle(opened(true));

        let stanzas = sent(&actions);
        assert_eq!(stanzas.len(), 1);
        assert_eq!(stanzas[0].name, "iq");
        assert!(stanzas[0].find("challenge").is_none());
        assert_eq!(m.phase(), ConnectionPhase::NodeDiscovery);
    }

    #[test]
    fn test_captcha_then_resolve_resends_discovery_with_response() {
        let mut m = machine(None);
        m.transport_ready();
        m.handle(opened(true));

        let actions = m.handle(Inbound::CaptchaChallenge {
            url: "https://example/captcha/abc".into(),
        });
        assert_eq!(m.phase(), ConnectionPhase::AwaitingCaptcha);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(ClientEvent::CaptchaChallenge { url }) if url == "https://example/captcha/abc"
        )));

        let actions = m.resolve_captcha("XYZ123").unwrap();
        assert_eq!(m.phase(), ConnectionPhase::NodeDiscovery);
        assert_eq!(m.session().captcha_token.as_deref(), Some("XYZ123"));
        let stanzas = sent(&actions);
        assert_eq!(
            stanzas[0]
                .find("challenge")
                .and_then(|c| c.child_text("response")),
            Some("XYZ123")
        );
    }

    #[test]
    fn test_resolve_captcha_outside_awaiting_is_invalid_phase() {
        let mut m = machine(None);
        m.transport_ready();
        let err = m.resolve_captcha("XYZ").unwrap_err();
        assert_eq!(
            err,
            ClientError::InvalidPhase {
                expected: ConnectionPhase::AwaitingCaptcha,
                actual: ConnectionPhase::NodeDiscovery,
            }
        );
    }

    #[test]
    fn test_node_issued_persists_before_reconnect() {
        let mut m = machine(None);
        m.transport_ready();
        let actions = m.handle(Inbound::NodeIssued {
            node: "node123@talk.kik.com".into(),
        });

        assert_eq!(actions.len(), 2);
        match &actions[0] {
            Action::Persist(session) => {
                assert_eq!(session.node.as_deref(), Some("node123@talk.kik.com"));
            }
            other => panic!("expected persist first, got {other:?}"),
        }
        assert!(matches!(actions[1], Action::Reconnect));

        // The rebuilt transport authenticates with the new node.
        m.transport_ready();
        assert_eq!(m.phase(), ConnectionPhase::Authenticating);
    }

    #[test]
    fn test_set_node_while_disconnected_only_persists() {
        let mut m = machine(None);
        let actions = m.set_node("n1");
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::Persist(_)));
        assert!(m.session().has_node());
    }

    #[test]
    fn test_auth_accepted_emits_authenticated() {
        let mut m = machine(Some("n1"));
        m.transport_ready();
        let actions = m.handle(opened(true));

        assert_eq!(m.phase(), ConnectionPhase::Authenticated);
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::Emit(ClientEvent::Authenticated)))
        );
    }

    #[test]
    fn test_auth_rejected_emits_error_and_disconnects() {
        let mut m = machine(Some("n1"));
        m.transport_ready();
        let actions = m.handle(opened(false));

        assert_eq!(m.phase(), ConnectionPhase::Disconnected);
        assert!(matches!(&actions[0], Action::Emit(ClientEvent::Error(_))));
        assert!(actions.iter().any(|a| matches!(a, Action::Disconnect)));
        assert!(
            actions
                .iter()
                .any(|a| matches!(a, Action::Emit(ClientEvent::Disconnected)))
        );
    }

    #[test]
    fn test_register_rejected_disconnects_without_retry() {
        let mut m = machine(None);
        m.transport_ready();
        let actions = m.handle(Inbound::RegisterRejected {
            code: Some(409),
            text: "bad password".into(),
        });
        assert_eq!(m.phase(), ConnectionPhase::Disconnected);
        assert!(sent(&actions).is_empty());
    }

    #[test]
    fn test_transport_lost_when_disconnected_emits_nothing() {
        let mut m = machine(None);
        let actions = m.transport_lost();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::Disconnect));
    }

    #[test]
    fn test_every_transition_emits_phase_changed() {
        let mut m = machine(Some("n1"));
        let actions = m.transport_ready();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(ClientEvent::PhaseChanged {
                from: ConnectionPhase::Disconnected,
                to: ConnectionPhase::Authenticating,
            })
        )));
    }

    #[test]
    fn test_non_handshake_inbound_maps_to_one_event() {
        let mut m = machine(Some("n1"));
        let message = ChatMessage {
            id: None,
            from: Jid::from("u1"),
            group: None,
            body: "hi".into(),
        };
        let actions = m.handle(Inbound::Message(message));
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            Action::Emit(ClientEvent::MessageReceived(msg)) if msg.body == "hi"
        ));

        let actions = m.handle(Inbound::Other(Stanza::new("ack")));
        assert!(matches!(&actions[..], [Action::Emit(ClientEvent::Unhandled(_))]));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ConnectionPhase::AwaitingCaptcha.to_string(), "awaiting-captcha");
        assert!(ConnectionPhase::Authenticating.is_handshaking());
        assert!(!ConnectionPhase::Authenticated.is_handshaking());
    }
}
