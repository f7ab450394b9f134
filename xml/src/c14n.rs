//! Canonical XML rendering for digesting and signing
//!
//! Renders an element subtree to the deterministic byte form both peers
//! agree on before hashing: attributes sorted with namespace declarations
//! first, no self-closing tags, canonical escaping. This is the exclusive
//! XML-C14N subset sufficient for H004 envelopes as this workspace emits
//! them (one default namespace plus the `ds` prefix); comments are already
//! dropped at parse time.

use crate::dom::{Element, Node};

/// Canonical byte rendering of a subtree.
pub fn canonicalize(el: &Element) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(el, &mut out);
    out.into_bytes()
}

fn write_canonical(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.name);

    // Namespace declarations before other attributes, each group sorted
    // by name.
    let mut ns_attrs: Vec<&(String, String)> = el
        .attributes
        .iter()
        .filter(|(k, _)| is_namespace_decl(k))
        .collect();
    ns_attrs.sort_by(|a, b| a.0.cmp(&b.0));
    let mut plain_attrs: Vec<&(String, String)> = el
        .attributes
        .iter()
        .filter(|(k, _)| !is_namespace_decl(k))
        .collect();
    plain_attrs.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, value) in ns_attrs.into_iter().chain(plain_attrs) {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape_attribute(value));
        out.push('"');
    }
    out.push('>');

    for node in &el.children {
        match node {
            Node::Element(child) => write_canonical(child, out),
            Node::Text(text) => out.push_str(&escape_text(text)),
        }
    }

    out.push_str("</");
    out.push_str(&el.name);
    out.push('>');
}

fn is_namespace_decl(name: &str) -> bool {
    name == "xmlns" || name.starts_with("xmlns:")
}

/// Character-data escaping (canonical form).
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
    out
}

/// Attribute-value escaping (canonical form).
pub fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Element;

    #[test]
    fn attributes_are_sorted_namespaces_first() {
        let el = Element::new("header")
            .attr("zeta", "2")
            .attr("xmlns:ds", "http://www.w3.org/2000/09/xmldsig#")
            .attr("alpha", "1")
            .attr("xmlns", "urn:org:ebics:H004");
        let bytes = canonicalize(&el);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "<header xmlns=\"urn:org:ebics:H004\" xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\" alpha=\"1\" zeta=\"2\"></header>"
        );
    }

    #[test]
    fn empty_elements_are_not_self_closed() {
        let el = Element::new("TransactionPhase");
        assert_eq!(canonicalize(&el), b"<TransactionPhase></TransactionPhase>");
    }

    #[test]
    fn canonical_form_is_stable_across_reparse() {
        let el = Element::new("mutable")
            .attr("authenticate", "true")
            .child(Element::leaf("SegmentNumber", "2"))
            .child(Element::leaf("Note", "a & b < c"));
        let first = canonicalize(&el);
        let reparsed = Element::parse(&el.to_xml()).unwrap();
        assert_eq!(first, canonicalize(&reparsed));
    }

    #[test]
    fn carriage_return_is_preserved_numerically() {
        let el = Element::leaf("t", "a\rb");
        assert_eq!(canonicalize(&el), b"<t>a&#xD;b</t>");
    }
}
