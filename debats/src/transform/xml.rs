//! A minimal owned XML element tree.
//!
//! Sitting reports are small enough to hold in memory, and the extraction logic navigates them
//! freely (first descendant with a given name, direct children, recursive text), so we parse the
//! whole document into a tree of [`Element`]s up front.

use anyhow::Error;
use quick_xml::escape;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use std::borrow::Cow;

/// An XML element with its text content.
///
/// Text is stored the way mixed content appears in the document: `text` is the text between the
/// start tag and the first child, and each child's `tail` is the text between its end tag and the
/// next sibling (or the end of the parent).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub tail: String,
    pub children: Vec<Element>,
}

impl Element {
    /// The value of the attribute `name`, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The first direct child named `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    /// All direct children named `name`, in document order.
    pub fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// The first element named `name` below this one, in document order.
    pub fn descendant(&self, name: &str) -> Option<&Element> {
        self.children.iter().find_map(|child| {
            if child.name == name {
                Some(child)
            } else {
                child.descendant(name)
            }
        })
    }

    /// All elements named `name` below this one, in document order.
    ///
    /// Matching elements nested inside other matching elements are included.
    pub fn descendants<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = vec![];
        self.collect_descendants(name, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                found.push(child);
            }
            child.collect_descendants(name, found);
        }
    }

    /// All the text inside this element, with the text of each child separated by spaces.
    ///
    /// The result keeps the original whitespace; use [`clean_text`](super::clean_text) to
    /// normalize it.
    pub fn text_content(&self) -> String {
        let mut parts = vec![];
        if !self.text.is_empty() {
            parts.push(self.text.clone());
        }
        for child in &self.children {
            parts.push(child.text_content());
            if !child.tail.is_empty() {
                parts.push(child.tail.clone());
            }
        }
        parts.join(" ")
    }
}

/// Parse an XML document into its root element.
pub fn parse(bytes: &[u8]) -> Result<Element, Error> {
    let source = decode(bytes);
    let mut reader = Reader::from_str(&source);

    let mut stack: Vec<Element> = vec![];
    let mut root = None;
    loop {
        let event = reader.read_event().map_err(|err| {
            Error::msg(format!(
                "malformed XML at position {}: {err}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(start) => stack.push(open(&start)),
            Event::Empty(start) => close(&mut stack, &mut root, open(&start)),
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::msg("unbalanced end tag in XML document"))?;
                close(&mut stack, &mut root, element);
            }
            Event::Text(text) => append_text(&mut stack, &unescape(&text)),
            Event::CData(data) => {
                append_text(&mut stack, &String::from_utf8_lossy(&data.into_inner()))
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions and doctypes carry no content.
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::msg("XML document ends inside an element"));
    }
    root.ok_or_else(|| Error::msg("XML document has no root element"))
}

fn open(start: &BytesStart) -> Element {
    let attributes = start
        .attributes()
        .filter_map(|attr| match attr {
            Ok(attr) => {
                let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                let value = match attr.unescape_value() {
                    Ok(value) => value.into_owned(),
                    Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
                };
                Some((key, value))
            }
            Err(err) => {
                tracing::warn!("skipping malformed attribute: {err}");
                None
            }
        })
        .collect();
    Element {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attributes,
        ..Default::default()
    }
}

fn close(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => tracing::warn!("ignoring extra root element <{}>", element.name),
    }
}

fn append_text(stack: &mut [Element], text: &str) {
    // Text outside the root element is insignificant whitespace.
    let Some(current) = stack.last_mut() else {
        return;
    };
    match current.children.last_mut() {
        Some(last) => last.tail.push_str(text),
        None => current.text.push_str(text),
    }
}

/// Unescape a text node, resolving the HTML entities which show up in sitting reports.
///
/// Each entity is resolved on its own: an unknown one is kept as is, without affecting the others.
fn unescape(text: &BytesText) -> String {
    let raw = String::from_utf8_lossy(text);
    let mut unescaped = String::with_capacity(raw.len());
    let mut rest = raw.as_ref();
    while let Some(start) = rest.find('&') {
        unescaped.push_str(&rest[..start]);
        rest = &rest[start..];
        let Some(end) = rest.find(';') else {
            break;
        };
        let entity = &rest[..=end];
        match escape::unescape_with(entity, html_entity) {
            Ok(value) => unescaped.push_str(&value),
            Err(err) => {
                tracing::debug!("keeping entity {entity}: {err}");
                unescaped.push_str(entity);
            }
        }
        rest = &rest[end + 1..];
    }
    unescaped.push_str(rest);
    unescaped
}

fn html_entity(entity: &str) -> Option<&'static str> {
    Some(match entity {
        "nbsp" => "\u{a0}",
        "laquo" => "«",
        "raquo" => "»",
        "rsquo" => "’",
        "lsquo" => "‘",
        "hellip" => "…",
        "ndash" => "–",
        "mdash" => "—",
        "oelig" => "œ",
        "eacute" => "é",
        "egrave" => "è",
        "agrave" => "à",
        "amp" => "&",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        _ => return None,
    })
}

/// Decode a document as UTF-8, falling back to Latin-1 for older reports.
fn decode(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}
