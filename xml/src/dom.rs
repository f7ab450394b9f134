//! Element tree with namespace-insensitive destructuring
//!
//! EBICS envelopes and camt documents arrive with varying namespace
//! prefixes, so all child lookups match on the local name (the part after
//! the last `:`). Attribute lookups are exact.

use crate::c14n::{escape_attribute, escape_text};
use crate::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

/// A node in the tree: child element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// One XML element. `name` is the qualified name as written in the
/// document (prefix kept); attributes preserve document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder: add an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// Builder: add a child element.
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Builder: add a text node.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    /// Builder: leaf element wrapping a single text node.
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Element::new(name).text(text)
    }

    /// Local name, with any namespace prefix stripped.
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// Exact-name attribute lookup.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Direct child elements, in document order.
    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// Concatenated direct text content.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Text content with surrounding whitespace removed.
    pub fn trimmed_text(&self) -> String {
        self.text_content().trim().to_string()
    }

    /// Assert this element's local name and hand it back.
    pub fn require_root(&self, local: &str) -> Result<&Element> {
        if self.local_name() == local {
            Ok(self)
        } else {
            Err(Error::Structure(format!(
                "expected root element '{}', found '{}'",
                local,
                self.local_name()
            )))
        }
    }

    /// Exactly one child with the given local name.
    pub fn require_unique_child(&self, local: &str) -> Result<&Element> {
        self.maybe_unique_child(local)?.ok_or_else(|| {
            Error::Structure(format!(
                "element '{}' has no child '{}'",
                self.local_name(),
                local
            ))
        })
    }

    /// At most one child with the given local name; `None` when absent.
    pub fn maybe_unique_child(&self, local: &str) -> Result<Option<&Element>> {
        let mut found = None;
        for el in self.child_elements() {
            if el.local_name() == local {
                if found.is_some() {
                    return Err(Error::Structure(format!(
                        "element '{}' has more than one child '{}'",
                        self.local_name(),
                        local
                    )));
                }
                found = Some(el);
            }
        }
        Ok(found)
    }

    /// Apply `f` to every child with the given local name, in order.
    pub fn map_each_child<T>(
        &self,
        local: &str,
        mut f: impl FnMut(&Element) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for el in self.child_elements() {
            if el.local_name() == local {
                out.push(f(el)?);
            }
        }
        Ok(out)
    }

    /// Trimmed text of a required unique child.
    pub fn require_child_text(&self, local: &str) -> Result<String> {
        Ok(self.require_unique_child(local)?.trimmed_text())
    }

    /// Trimmed text of an optional unique child.
    pub fn maybe_child_text(&self, local: &str) -> Result<Option<String>> {
        Ok(self.maybe_unique_child(local)?.map(|el| el.trimmed_text()))
    }

    /// Depth-first search for every element satisfying the predicate.
    /// A matching element is not descended into.
    pub fn find_all<'a>(&'a self, pred: &dyn Fn(&Element) -> bool) -> Vec<&'a Element> {
        let mut out = Vec::new();
        if pred(self) {
            out.push(self);
            return out;
        }
        for el in self.child_elements() {
            out.extend(el.find_all(pred));
        }
        out
    }

    /// First descendant (depth-first) with the given local name.
    pub fn find_first(&self, local: &str) -> Option<&Element> {
        if self.local_name() == local {
            return Some(self);
        }
        for el in self.child_elements() {
            if let Some(found) = el.find_first(local) {
                return Some(found);
            }
        }
        None
    }

    /// Parse a document; returns the root element. Comments and
    /// processing instructions are dropped.
    pub fn parse(input: &str) -> Result<Element> {
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let mut el = Element::new(String::from_utf8_lossy(start.name().as_ref()));
                    for attr in start.attributes() {
                        let attr = attr.map_err(|e| Error::Parse(e.to_string()))?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = attr
                            .unescape_value()
                            .map_err(|e| Error::Parse(e.to_string()))?
                            .to_string();
                        el.attributes.push((key, value));
                    }
                    stack.push(el);
                }
                Event::Empty(start) => {
                    let mut el = Element::new(String::from_utf8_lossy(start.name().as_ref()));
                    for attr in start.attributes() {
                        let attr = attr.map_err(|e| Error::Parse(e.to_string()))?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                        let value = attr
                            .unescape_value()
                            .map_err(|e| Error::Parse(e.to_string()))?
                            .to_string();
                        el.attributes.push((key, value));
                    }
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Text(text) => {
                    let value = text.unescape().map_err(|e| Error::Parse(e.to_string()))?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(value.to_string()));
                    }
                    // Text outside the root (leading/trailing whitespace)
                    // carries no information and is dropped.
                }
                Event::CData(cdata) => {
                    let value = String::from_utf8_lossy(cdata.as_ref()).to_string();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(value));
                    }
                }
                Event::End(_) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| Error::Parse("unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if !stack.is_empty() {
            return Err(Error::Parse("unexpected end of document".to_string()));
        }
        root.ok_or_else(|| Error::Parse("document has no root element".to_string()))
    }

    /// Serialize this subtree. Attributes keep document order; text is
    /// escaped. No XML declaration is emitted, see [`Element::to_document`].
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        write_element(self, &mut out);
        out
    }

    /// Serialize as a standalone document with an XML declaration.
    pub fn to_document(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        write_element(self, &mut out);
        out
    }
}

fn attach(stack: &mut Vec<Element>, root: &mut Option<Element>, el: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(el));
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err(Error::Parse("multiple root elements".to_string()));
            }
            *root = Some(el);
            Ok(())
        }
    }
}

fn write_element(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.name);
    for (key, value) in &el.attributes {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attribute(value));
        out.push('"');
    }
    if el.children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for node in &el.children {
        match node {
            Node::Element(child) => write_element(child, out),
            Node::Text(text) => out.push_str(&escape_text(text)),
        }
    }
    out.push_str("</");
    out.push_str(&el.name);
    out.push('>');
}
