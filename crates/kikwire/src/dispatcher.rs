//! Correlation dispatcher: matches replies to the requests waiting on them.
//!
//! Every request that expects a reply is registered here under its
//! correlation id together with a single-shot reply channel. When a
//! stanza arrives, [`Dispatcher::route`] checks its `id`:
//!
//! - a registered id consumes the stanza: the waiter gets it (or the
//!   server's error) exactly once, and the registration is removed.
//! - anything else is handed back to the caller for classification as a
//!   broadcast event.
//!
//! Registrations also end on teardown ([`Dispatcher::fail_all`]) and on
//! timeout ([`Dispatcher::expire`]), so a waiter is never left hanging.

use std::collections::HashMap;
use std::time::Duration;

use kikwire_protocol::{CorrelationId, Stanza};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::RequestError;

/// What a waiting request eventually receives.
pub type Reply = Result<Stanza, RequestError>;

struct Pending {
    reply: oneshot::Sender<Reply>,
    sent_at: Instant,
}

/// Outstanding requests keyed by correlation id.
///
/// Owned by the connection task; not shared, so no locking.
#[derive(Default)]
pub struct Dispatcher {
    pending: HashMap<CorrelationId, Pending>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `id`.
    ///
    /// # Errors
    /// [`RequestError::DuplicateId`] if `id` is already outstanding. The
    /// existing registration is left alone and the new waiter receives
    /// the same error.
    pub fn register(
        &mut self,
        id: CorrelationId,
        reply: oneshot::Sender<Reply>,
        now: Instant,
    ) -> Result<(), RequestError> {
        if self.pending.contains_key(&id) {
            let err = RequestError::DuplicateId(id);
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        }
        tracing::trace!(%id, "request registered");
        self.pending.insert(id, Pending { reply, sent_at: now });
        Ok(())
    }

    /// Delivers `stanza` to its waiter if its id is registered.
    ///
    /// Returns `None` when the stanza was consumed, or gives it back when
    /// nobody was waiting for it.
    pub fn route(&mut self, stanza: Stanza) -> Option<Stanza> {
        let Some(pending) = stanza
            .id()
            .and_then(|id| self.pending.remove(&CorrelationId::from(id)))
        else {
            return Some(stanza);
        };

        let id = stanza.id().unwrap_or_default().to_string();
        let reply = if stanza.get_attr("type") == Some("error") {
            Err(server_error(&stanza))
        } else {
            Ok(stanza)
        };
        if pending.reply.send(reply).is_err() {
            tracing::debug!(%id, "reply arrived after the caller gave up");
        }
        None
    }

    /// Fails every outstanding request with `err`. Returns how many
    /// there were.
    pub fn fail_all(&mut self, err: RequestError) -> usize {
        let count = self.pending.len();
        for (id, pending) in self.pending.drain() {
            tracing::debug!(%id, error = %err, "failing pending request");
            let _ = pending.reply.send(Err(err.clone()));
        }
        count
    }

    /// Fails requests registered more than `timeout` before `now` with
    /// [`RequestError::Timeout`], returning their ids.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<CorrelationId> {
        let expired: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(pending) = self.pending.remove(id) {
                tracing::warn!(%id, ?timeout, "request timed out");
                let _ = pending.reply.send(Err(RequestError::Timeout(timeout)));
            }
        }
        expired
    }

    /// Drops a registration without notifying its waiter.
    pub fn cancel(&mut self, id: &CorrelationId) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn server_error(stanza: &Stanza) -> RequestError {
    let error = stanza.get_child("error");
    let code = error
        .and_then(|e| e.get_attr("code"))
        .and_then(|c| c.parse().ok());
    let text = error
        .and_then(|e| {
            e.child_text("text")
                .or(e.text.as_deref())
                .or_else(|| e.children.first().map(|c| c.name.as_str()))
        })
        .unwrap_or("error reply without details")
        .to_string();
    RequestError::Server { code, text }
}
