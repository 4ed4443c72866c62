//! Wire protocol for kikwire.
//!
//! This crate defines what the client and the Kik server say to each
//! other, without knowing anything about sockets or sessions:
//!
//! - **Stanzas** ([`Stanza`]): one protocol message unit, a small XML
//!   element tree.
//! - **Codec** ([`codec`], [`StanzaReader`], [`Frame`]): turning stanzas
//!   into bytes and a byte stream back into frames. Stanzas may be split
//!   across reads, or several may arrive in one read.
//! - **Builders** ([`requests`]): one pure function per logical
//!   operation. Operations that expect a reply return a [`Request`]
//!   carrying its [`CorrelationId`].
//! - **Classification** ([`inbound`]): mapping an unsolicited frame to
//!   exactly one [`Inbound`] meaning.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (Frame / Stanza) → Client (dispatch + state)
//! ```

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

pub mod codec;
mod error;
pub mod inbound;
pub mod requests;
mod stanza;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::{Frame, StanzaReader};
pub use error::ProtocolError;
pub use inbound::{Inbound, classify};
pub use requests::Request;
pub use stanza::Stanza;
pub use types::{
    ChatMessage, CorrelationId, Credentials, GROUP_DOMAIN, Group, Jid, USER_DOMAIN, User,
};
