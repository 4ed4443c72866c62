//! Broadcast events and the subscriber side of them.
//!
//! Everything the server tells us that isn't a reply to a specific
//! request ends up here as exactly one [`ClientEvent`], fanned out to
//! every [`EventStream`] over a `tokio::sync::broadcast` channel.

use std::sync::Arc;

use kikwire_protocol::{ChatMessage, Group, Jid, Stanza, User};
use tokio::sync::broadcast;

use crate::{ConnectionPhase, KikError};

/// An unsolicited event from the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The connection moved to a new phase.
    PhaseChanged {
        from: ConnectionPhase,
        to: ConnectionPhase,
    },

    /// The handshake completed; requests now go straight to the wire.
    Authenticated,

    /// Node discovery needs a captcha solved. Answer it with
    /// [`KikClient::resolve_captcha`](crate::KikClient::resolve_captcha).
    CaptchaChallenge { url: String },

    /// A roster that nobody requested explicitly (e.g. the one fetched
    /// on login).
    RosterReceived { groups: Vec<Group>, friends: Vec<User> },

    /// Profile information for a batch of JIDs.
    JidInfoReceived { users: Vec<User> },

    /// A member left a group.
    UserLeftGroup { group: Jid, user: Jid },

    /// A chat message arrived.
    MessageReceived(ChatMessage),

    /// A stanza nothing else recognised.
    Unhandled(Stanza),

    /// The connection is gone. Call `connect()` again to resume; the
    /// client does not reconnect on its own.
    Disconnected,

    /// Something failed outside any single request: transport loss,
    /// handshake rejection, or a session that couldn't be saved.
    Error(Arc<KikError>),
}

impl ClientEvent {
    pub(crate) fn error(err: impl Into<KikError>) -> Self {
        Self::Error(Arc::new(err.into()))
    }
}

/// A subscription to [`ClientEvent`]s.
///
/// Created by [`KikClient::subscribe`](crate::KikClient::subscribe).
/// Only events sent after subscribing are seen.
pub struct EventStream {
    rx: broadcast::Receiver<ClientEvent>,
}

impl EventStream {
    pub(crate) fn new(rx: broadcast::Receiver<ClientEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next event. Returns `None` once the client has shut
    /// down.
    ///
    /// A subscriber that falls behind by more than the channel capacity
    /// skips the oldest events; that is logged and otherwise ignored.
    pub async fn next(&mut self) -> Option<ClientEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the next event matching `pred`, discarding the rest.
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&ClientEvent) -> bool,
    ) -> Option<ClientEvent> {
        while let Some(event) = self.next().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Waits for a captcha challenge and returns its URL.
    ///
    /// This is the hand-off point to whoever solves captchas. It has no
    /// timeout of its own; drop the future to cancel, or bound it:
    ///
    /// ```rust,ignore
    /// let url = tokio::time::timeout(Duration::from_secs(300), events.wait_for_captcha()).await?;
    /// ```
    pub async fn wait_for_captcha(&mut self) -> Option<String> {
        match self
            .wait_for(|e| matches!(e, ClientEvent::CaptchaChallenge { .. }))
            .await?
        {
            ClientEvent::CaptchaChallenge { url } => Some(url),
            _ => None,
        }
    }
}
