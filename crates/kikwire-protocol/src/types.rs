//! Core protocol types shared by builders, the inbound classifier, and
//! the client.
//!
//! These are the *decoded* shapes of what travels on the wire: who a
//! stanza is addressed to, which request it answers, and the roster
//! entities the server tells us about.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain of ordinary user JIDs.
pub const USER_DOMAIN: &str = "talk.kik.com";

/// Domain of group JIDs. A JID ending in this is a group conversation.
pub const GROUP_DOMAIN: &str = "groups.kik.com";

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A Jabber-style identifier for a user or a group, e.g.
/// `alice_x1y@talk.kik.com` or `1100221@groups.kik.com`.
///
/// Newtype over `String` so a JID can't be confused with a display name
/// or a message body in function signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    /// Creates a JID from anything string-like.
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    /// Returns `true` for group conversations.
    pub fn is_group(&self) -> bool {
        self.0.ends_with(GROUP_DOMAIN)
    }

    /// The part before `@`, or the whole JID if there is none.
    pub fn local_part(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }

    /// Borrows the JID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Jid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier attached to a request stanza (`id` attribute) and echoed
/// back by the server in its reply.
///
/// Generated ids are random UUID-v4 strings, so two requests never share
/// one within a process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Wraps an existing id (e.g. one read from an inbound stanza).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random UUID-v4 id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrows the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Account credentials
// ---------------------------------------------------------------------------

/// Username and password of the account the client logs in as.
///
/// `Debug` is implemented by hand so the password never ends up in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Roster entities
// ---------------------------------------------------------------------------

/// A user as described by a roster entry or a JID-info lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub jid: Jid,
    /// Public username (`@handle`), when the server supplied one.
    pub username: Option<String>,
    /// Display name, when the server supplied one.
    pub display_name: Option<String>,
}

impl User {
    /// A user known only by JID.
    pub fn from_jid(jid: impl Into<Jid>) -> Self {
        Self {
            jid: jid.into(),
            username: None,
            display_name: None,
        }
    }
}

/// A group conversation and its member JIDs, in roster order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub jid: Jid,
    /// Group name, if one was set.
    pub name: Option<String>,
    /// Public group code (`#hashtag`), if any.
    pub code: Option<String>,
    pub users: Vec<Jid>,
}

impl Group {
    /// A group with no name or code.
    pub fn new(jid: impl Into<Jid>, users: Vec<Jid>) -> Self {
        Self {
            jid: jid.into(),
            name: None,
            code: None,
            users,
        }
    }
}

/// An incoming chat message, private or group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned message id.
    pub id: Option<String>,
    /// Sender of the message.
    pub from: Jid,
    /// The group it was posted in, for group messages.
    pub group: Option<Jid>,
    pub body: String,
}
