//! Stanza codec: [`Stanza`] trees to XML text and back.
//!
//! Encoding is a straightforward tree walk. Decoding is incremental:
//! the transport hands us arbitrary byte chunks, so [`StanzaReader`]
//! buffers them and yields a [`Frame`] each time a complete top-level
//! element has arrived.
//!
//! The stream itself is wrapped in a `<k ...>` element that stays open
//! for the whole session. Its start tag is reported as
//! [`Frame::StreamOpen`] as soon as it arrives, and its end tag as
//! [`Frame::StreamClose`]; everything in between is a sequence of
//! [`Frame::Stanza`]s.

use quick_xml::Reader;
use quick_xml::errors::{IllFormedError, SyntaxError};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::{ProtocolError, Stanza};

/// Tag name of the stream wrapper element.
pub const STREAM_TAG: &str = "k";

/// Upper bound on bytes buffered while waiting for one stanza to
/// complete. Roster replies for large accounts run to tens of KB.
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encodes a complete element, self-closing it when it has no content.
pub fn encode(stanza: &Stanza) -> String {
    let mut out = String::with_capacity(64);
    write_element(&mut out, stanza);
    out
}

/// Encodes only the start tag of an element.
///
/// Used for stream headers (`<k ...>`), which the client opens and never
/// closes.
pub fn encode_open(stanza: &Stanza) -> String {
    let mut out = String::with_capacity(64);
    write_start(&mut out, stanza);
    out.push('>');
    out
}

fn write_start(out: &mut String, stanza: &Stanza) {
    out.push('<');
    out.push_str(&stanza.name);
    for (key, value) in &stanza.attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value.as_str()));
        out.push('"');
    }
}

fn write_element(out: &mut String, stanza: &Stanza) {
    write_start(out, stanza);
    if stanza.children.is_empty() && stanza.text.is_none() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    if let Some(text) = &stanza.text {
        out.push_str(&escape(text.as_str()));
    }
    for child in &stanza.children {
        write_element(out, child);
    }
    out.push_str("</");
    out.push_str(&stanza.name);
    out.push('>');
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// One unit produced by [`StanzaReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The server opened (or re-opened) the stream. Carries the header's
    /// attributes, e.g. `ok="1"`.
    StreamOpen(Stanza),
    /// A complete top-level stanza.
    Stanza(Stanza),
    /// The server closed the stream (`</k>`).
    StreamClose,
}

impl Frame {
    /// Borrows the element carried by this frame, if any.
    pub fn stanza(&self) -> Option<&Stanza> {
        match self {
            Self::StreamOpen(s) | Self::Stanza(s) => Some(s),
            Self::StreamClose => None,
        }
    }

    /// Takes the element carried by this frame, if any.
    pub fn into_stanza(self) -> Option<Stanza> {
        match self {
            Self::StreamOpen(s) | Self::Stanza(s) => Some(s),
            Self::StreamClose => None,
        }
    }
}

/// Incremental reader that turns byte chunks into [`Frame`]s.
///
/// Feed it whatever the transport delivers, then drain frames with
/// [`next_frame`](Self::next_frame) until it returns `Ok(None)`.
/// Frames come out in exactly the order their bytes arrived.
#[derive(Debug, Default)]
pub struct StanzaReader {
    buffer: Vec<u8>,
    // Buffer length at the last parse that ran out of input.
    incomplete_at: Option<usize>,
}

impl StanzaReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Discards any buffered partial input.
    ///
    /// Called when the client sends a new stream header: whatever was
    /// half-read belongs to the previous stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.incomplete_at = None;
    }

    /// Number of bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, or `Ok(None)` if more bytes are
    /// needed.
    ///
    /// # Errors
    /// - [`ProtocolError::Malformed`] if the buffered bytes can never
    ///   become valid XML. The offending bytes are discarded.
    /// - [`ProtocolError::Oversized`] if [`MAX_BUFFERED_BYTES`] is
    ///   exceeded without completing a stanza. The buffer is cleared.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let Some(start) = self
                .buffer
                .iter()
                .position(|b| !b.is_ascii_whitespace())
            else {
                self.buffer.clear();
                return Ok(None);
            };
            self.buffer.drain(..start);

            // XML declaration or processing instruction.
            if self.buffer.starts_with(b"<?") {
                match find(&self.buffer, b"?>") {
                    Some(end) => {
                        self.buffer.drain(..end + 2);
                        continue;
                    }
                    None => return self.need_more(),
                }
            }

            // A top-level end tag can only close the stream wrapper.
            if self.buffer.starts_with(b"</") {
                return match self.buffer.iter().position(|&b| b == b'>') {
                    Some(end) => {
                        self.buffer.drain(..=end);
                        Ok(Some(Frame::StreamClose))
                    }
                    None => self.need_more(),
                };
            }

            // Stray text between stanzas.
            if self.buffer[0] != b'<' {
                let next = self
                    .buffer
                    .iter()
                    .position(|&b| b == b'<')
                    .unwrap_or(self.buffer.len());
                tracing::trace!(bytes = next, "skipping text between stanzas");
                self.buffer.drain(..next);
                continue;
            }

            // No element can finish before another `>` arrives.
            if let Some(seen) = self.incomplete_at {
                if !self.buffer[seen.min(self.buffer.len())..].contains(&b'>') {
                    return self.need_more();
                }
            }

            return match parse_element(&self.buffer) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.drain(..consumed);
                    self.incomplete_at = None;
                    Ok(Some(frame))
                }
                Ok(None) => {
                    self.incomplete_at = Some(self.buffer.len());
                    self.need_more()
                }
                Err(e) => {
                    self.reset();
                    Err(e)
                }
            };
        }
    }

    fn need_more(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buffer.len() > MAX_BUFFERED_BYTES {
            self.reset();
            return Err(ProtocolError::Oversized(MAX_BUFFERED_BYTES));
        }
        Ok(None)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `<!` markup that more input could still turn into a comment, CDATA
/// section or doctype.
fn is_partial_bang(buf: &[u8]) -> bool {
    let Some(at) = find_last(buf, b"<!") else {
        return false;
    };
    let tail = &buf[at..];
    const MARKUP: [&[u8]; 3] = [b"<!--", b"<![CDATA[", b"<!DOCTYPE"];
    MARKUP
        .iter()
        .any(|markup| tail.len() < markup.len() && markup.starts_with(tail))
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn malformed(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Malformed(e.to_string())
}

fn element_from(start: &BytesStart<'_>) -> Result<Stanza, ProtocolError> {
    let mut stanza =
        Stanza::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        stanza.attrs.push((key, value));
    }
    Ok(stanza)
}

fn push_text(stanza: &mut Stanza, text: &str) {
    match &mut stanza.text {
        Some(existing) => existing.push_str(text),
        None => stanza.text = Some(text.to_string()),
    }
}

/// Parses the element starting at the beginning of `buf`.
///
/// Returns the frame and the number of bytes it spans, or `None` when
/// `buf` ends before the element does.
fn parse_element(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let mut reader = Reader::from_reader(buf);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Stanza> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let element = element_from(&e)?;
                if stack.is_empty() && element.name == STREAM_TAG {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(element), end)));
                }
                stack.push(element);
            }
            Ok(Event::Empty(e)) => {
                let element = element_from(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some((Frame::Stanza(element), end)));
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(malformed)?;
                if let Some(top) = stack.last_mut() {
                    push_text(top, &text);
                }
            }
            Ok(Event::CData(c)) => {
                let raw = c.into_inner();
                if let Some(top) = stack.last_mut() {
                    push_text(top, &String::from_utf8_lossy(&raw));
                }
            }
            Ok(Event::End(_)) => {
                let Some(done) = stack.pop() else {
                    return Err(ProtocolError::Malformed(
                        "unexpected end tag".into(),
                    ));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some((Frame::Stanza(done), end)));
                    }
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            // Truncated markup: the rest is still on the wire.
            Err(quick_xml::Error::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedPIOrXmlDecl,
            )) => return Ok(None),
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup))
                if is_partial_bang(buf) =>
            {
                return Ok(None);
            }
            Err(quick_xml::Error::IllFormed(IllFormedError::MissingEndTag(_))) => {
                return Ok(None);
            }
            Err(e) => return Err(malformed(e)),
        }
    }
}
