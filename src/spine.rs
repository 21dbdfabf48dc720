//! Spine (reading order) parsing
//!
//! The spine defines the linear reading order of the book. Order is
//! significant and never rearranged.

use quick_xml::events::Event;

use crate::error::EpubLintError;
use crate::xml::{get_attribute, line_at, local_name, reader};

/// A single `<itemref>` in the spine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpineItem {
    /// Manifest item this spine entry references
    pub idref: String,
    /// Raw `linear` attribute, if present
    pub linear: Option<String>,
    /// Optional properties (e.g. "page-spread-left")
    pub properties: Option<String>,
    /// 1-based line of the `<itemref>` in the package document
    pub line: usize,
}

impl SpineItem {
    /// Whether this item is part of the linear reading order.
    pub fn is_linear(&self) -> bool {
        self.linear.as_deref() != Some("no")
    }

    /// Returns `true` if `linear` is present with a value other than
    /// `yes`/`no`.
    pub fn has_invalid_linear(&self) -> bool {
        self.linear
            .as_deref()
            .is_some_and(|v| v != "yes" && v != "no")
    }
}

/// Spine represents the reading order of an EPUB
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Spine {
    items: Vec<SpineItem>,
    toc_id: Option<String>,
}

impl Spine {
    /// Get a reference to the ordered spine entries
    pub fn items(&self) -> &[SpineItem] {
        &self.items
    }

    /// Get optional TOC item id from `<spine toc="...">` (EPUB 2.0).
    pub fn toc_id(&self) -> Option<&str> {
        self.toc_id.as_deref()
    }

    /// Get total number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if spine is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `true` if any itemref references `id`.
    pub fn references(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.idref == id)
    }
}

/// Parse spine from OPF content
pub fn parse_spine(content: &[u8]) -> Result<Spine, EpubLintError> {
    let mut reader = reader(content);
    let mut buf = Vec::new();
    let mut spine = Spine::default();
    let mut in_spine = false;

    loop {
        let event = reader.read_event_into(&mut buf);
        let is_start = matches!(event, Ok(Event::Start(_)));
        match event {
            Ok(Event::Start(e) | Event::Empty(e)) => {
                let name = local_name(e.name().as_ref(), &reader);
                if name == "spine" {
                    in_spine = is_start;
                    spine.toc_id = get_attribute(&e, &reader, "toc").filter(|v| !v.is_empty());
                } else if in_spine && name == "itemref" {
                    spine.items.push(SpineItem {
                        idref: get_attribute(&e, &reader, "idref").unwrap_or_default(),
                        linear: get_attribute(&e, &reader, "linear"),
                        properties: get_attribute(&e, &reader, "properties"),
                        line: line_at(
                            content,
                            (reader.buffer_position() as usize).saturating_sub(1),
                        ),
                    });
                }
            }
            Ok(Event::End(e)) => {
                if local_name(e.name().as_ref(), &reader) == "spine" {
                    in_spine = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EpubLintError::Parse(format!("XML parse error: {:?}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(spine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spine_order_and_toc() {
        let opf = br#"<package><manifest/>
<spine toc="ncx">
  <itemref idref="c1"/>
  <itemref idref="c2" linear="no"/>
  <itemref idref="c3" linear="maybe"/>
</spine></package>"#;
        let spine = parse_spine(opf).unwrap();
        assert_eq!(spine.toc_id(), Some("ncx"));
        let ids: Vec<&str> = spine.items().iter().map(|i| i.idref.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(spine.items()[0].is_linear());
        assert!(!spine.items()[1].is_linear());
        assert!(spine.items()[2].has_invalid_linear());
        assert!(!spine.items()[1].has_invalid_linear());
        assert_eq!(spine.items()[0].line, 3);
        assert!(spine.references("c2"));
    }

    #[test]
    fn test_parse_spine_empty() {
        let spine = parse_spine(b"<package><spine/></package>").unwrap();
        assert!(spine.is_empty());
        assert_eq!(spine.toc_id(), None);
    }

    #[test]
    fn test_itemref_outside_spine_ignored() {
        let spine = parse_spine(b"<package><itemref idref=\"x\"/><spine/></package>").unwrap();
        assert_eq!(spine.len(), 0);
    }

    #[test]
    fn test_self_closed_spine_does_not_collect_following_itemrefs() {
        let spine =
            parse_spine(b"<package><spine toc=\"ncx\"/><itemref idref=\"late\"/></package>").unwrap();
        assert_eq!(spine.toc_id(), Some("ncx"));
        assert!(spine.is_empty());
    }
}
