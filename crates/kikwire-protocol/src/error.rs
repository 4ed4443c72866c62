//! Error types for the protocol layer.
//!
//! Each crate in kikwire defines its own error enum. When you see a
//! `ProtocolError`, the problem is in turning bytes into stanzas (or a
//! stanza into something meaningful), not in networking or persistence.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The byte stream is not well-formed XML.
    ///
    /// Carries the parser's description. Incomplete input is NOT an
    /// error: the streaming reader simply waits for more bytes.
    #[error("malformed XML: {0}")]
    Malformed(String),

    /// Buffered input grew past the size limit without yielding a
    /// complete stanza.
    #[error("stanza buffer exceeded {0} bytes")]
    Oversized(usize),

    /// The input held no complete stanza where one was required.
    #[error("incomplete stanza")]
    Incomplete,

    /// The stanza parsed but violates the protocol's expectations,
    /// e.g. a roster item without a `jid`.
    #[error("invalid stanza: {0}")]
    InvalidStanza(String),
}
