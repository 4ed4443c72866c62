//! The stanza tree: one protocol message unit as a small XML element.

use std::fmt;

use crate::{ProtocolError, StanzaReader, codec};

/// One XML element with attributes, child elements, and optional text.
///
/// Attributes keep insertion order so encoded stanzas read the same way
/// they were built. Mixed content (text interleaved with children) is
/// flattened: all text directly inside the element is concatenated into
/// `text`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stanza {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Stanza>,
    pub text: Option<String>,
}

impl Stanza {
    /// Creates an empty element with the given tag name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets (or replaces) an attribute. Builder style.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Appends a child element. Builder style.
    pub fn child(mut self, child: Stanza) -> Self {
        self.children.push(child);
        self
    }

    /// Appends several child elements. Builder style.
    pub fn children(mut self, children: impl IntoIterator<Item = Stanza>) -> Self {
        self.children.extend(children);
        self
    }

    /// Sets the text content. Builder style.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets (or replaces) an attribute in place.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Looks up an attribute value.
    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `id` attribute, which carries the correlation id on requests
    /// and replies.
    pub fn id(&self) -> Option<&str> {
        self.get_attr("id")
    }

    /// First direct child with the given tag name.
    pub fn get_child(&self, name: &str) -> Option<&Stanza> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children with the given tag name, in document order.
    pub fn children_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Stanza> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first direct child with the given tag name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.get_child(name).and_then(|c| c.text.as_deref())
    }

    /// Depth-first search for the first descendant (or self) with the
    /// given tag name.
    pub fn find(&self, name: &str) -> Option<&Stanza> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Parses one complete element from a string.
    ///
    /// A bare stream header such as `<k ok="1">` is accepted too, since
    /// that is how the server opens a stream.
    ///
    /// # Errors
    /// [`ProtocolError::Incomplete`] if the input ends mid-element,
    /// [`ProtocolError::Malformed`] if it is not XML.
    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let mut reader = StanzaReader::new();
        reader.feed(input.as_bytes());
        match reader.next_frame()? {
            Some(frame) => frame.into_stanza().ok_or(ProtocolError::Incomplete),
            None => Err(ProtocolError::Incomplete),
        }
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::encode(self))
    }
}
