//! Tolerant content-document scanner
//!
//! Content documents are frequently not well-formed, so ids, links, inline
//! styles and entity references are collected by a tag-level scan instead
//! of a full XML parse. Comments are blanked out first (keeping byte offsets
//! and line breaks intact) so commented-out markup never produces findings,
//! and escaped text (`&lt;p id=..&gt;`) never looks like a tag. A separate
//! quick-xml pass reports the first well-formedness fault.

use std::sync::LazyLock;

use quick_xml::events::Event;
use regex::Regex;

use crate::xml::{reader, unescape_lossy};

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([A-Za-z][\w:.\-]*)((?:[^<>"']|"[^"]*"|'[^']*')*)>"#).expect("valid tag regex")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w:.\-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid attribute regex")
});

static ENTITY_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&([A-Za-z_][\w.\-]*);").expect("valid entity regex"));

static ENTITY_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!ENTITY\s+(?:%\s+)?([A-Za-z_][\w.\-]*)").expect("valid entity declaration regex")
});

/// Entities every XML parser knows without a declaration.
const PREDEFINED_ENTITIES: [&str; 5] = ["amp", "lt", "gt", "quot", "apos"];

/// DTDs that pull in the HTML entity sets.
const XHTML_ENTITY_DTDS: [&str; 6] = [
    "xhtml1-strict.dtd",
    "xhtml1-transitional.dtd",
    "xhtml11.dtd",
    "xhtml-lat1.ent",
    "xhtml-special.ent",
    "xhtml-symbol.ent",
];

/// Byte offset to 1-based line lookup.
#[derive(Clone, Debug)]
pub(crate) struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            text.bytes()
                .enumerate()
                .filter(|&(_, b)| b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { starts }
    }

    pub(crate) fn line(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }
}

/// Replace every `open ... close` region with spaces, keeping newlines so
/// offsets and line numbers stay valid. An unterminated region runs to the
/// end of the text.
pub(crate) fn blank_regions(text: &str, open: &str, close: &str) -> String {
    if !text.contains(open) {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        let after = &rest[start + open.len()..];
        let (region_len, tail) = match after.find(close) {
            Some(end) => (open.len() + end + close.len(), &after[end + close.len()..]),
            None => (rest.len() - start, ""),
        };
        blank_into(&rest[start..start + region_len], &mut out);
        rest = tail;
    }
    out.push_str(rest);
    out
}

fn blank_into(region: &str, out: &mut String) {
    for c in region.chars() {
        if c == '\n' {
            out.push('\n');
        } else {
            // Keep byte length so offsets into the original stay valid
            for _ in 0..c.len_utf8() {
                out.push(' ');
            }
        }
    }
}

/// Markup with `<!-- ... -->` comments blanked.
pub fn strip_comments(text: &str) -> String {
    blank_regions(text, "<!--", "-->")
}

/// A `<!DOCTYPE ...>` declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Doctype {
    /// Full declaration text
    pub raw: String,
    /// Contents of the `[...]` internal subset, if any
    pub internal_subset: Option<String>,
    /// Entity names declared in the internal subset
    pub declared_entities: Vec<String>,
    /// Byte offset just past the closing `>`
    pub end: usize,
}

impl Doctype {
    /// Returns `true` if the declaration references an XHTML 1.x DTD that
    /// defines the HTML named entities.
    pub fn defines_html_entities(&self) -> bool {
        XHTML_ENTITY_DTDS.iter().any(|dtd| self.raw.contains(dtd))
    }

    /// Returns `true` if `name` is usable without error under this doctype.
    pub fn declares(&self, name: &str) -> bool {
        self.defines_html_entities() || self.declared_entities.iter().any(|e| e == name)
    }
}

/// Locate and parse the document type declaration in comment-free text.
pub fn find_doctype(text: &str) -> Option<Doctype> {
    let start = find_ascii_case_insensitive(text, "<!doctype")?;
    let bytes = text.as_bytes();
    let mut i = start + "<!doctype".len();
    let mut quote: Option<u8> = None;
    let mut subset_start = None;
    let mut subset_end = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'[' if subset_start.is_none() => subset_start = Some(i + 1),
                b']' if subset_start.is_some() && subset_end.is_none() => subset_end = Some(i),
                b'>' if subset_start.is_none() || subset_end.is_some() => break,
                _ => {}
            },
        }
        i += 1;
    }
    let end = (i + 1).min(text.len());
    let internal_subset = match (subset_start, subset_end) {
        (Some(s), Some(e)) => Some(text[s..e].to_string()),
        (Some(s), None) => Some(text[s..end].to_string()),
        _ => None,
    };
    let declared_entities = internal_subset
        .as_deref()
        .map(|subset| {
            ENTITY_DECL_RE
                .captures_iter(subset)
                .map(|c| c[1].to_string())
                .collect()
        })
        .unwrap_or_default();
    Some(Doctype {
        raw: text[start..end].to_string(),
        internal_subset,
        declared_entities,
        end,
    })
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// One start or empty tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// Lower-cased local name (prefix stripped)
    pub name: String,
    /// `(name, unescaped value)` pairs as written
    pub attributes: Vec<(String, String)>,
    /// 1-based line of the `<`
    pub line: usize,
    /// Byte offset just past the closing `>`
    pub end: usize,
}

impl Tag {
    /// Attribute value by exact name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// What an outgoing reference is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// `href` on `<a>`/`<area>`: navigable, fragments must resolve
    Hyperlink,
    /// `<link href>`, `src`, `xlink:href`: embedded resource
    Resource,
}

/// An outgoing reference found in a content document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    /// Target as written (unescaped)
    pub href: String,
    /// 1-based line
    pub line: usize,
    /// Reference kind
    pub kind: LinkKind,
}

/// A named entity reference outside comments and CDATA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityRef {
    /// Entity name without `&` and `;`
    pub name: String,
    /// 1-based line
    pub line: usize,
}

/// A piece of CSS embedded in markup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CssFragment {
    /// Style text
    pub text: String,
    /// 1-based line where the fragment starts
    pub line: usize,
    /// `true` for a `style=` attribute, `false` for a `<style>` element
    pub inline: bool,
}

/// First XML well-formedness fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlFault {
    /// 1-based line
    pub line: usize,
    /// Parser message
    pub message: String,
}

/// Everything the checks need from one content document.
#[derive(Clone, Debug, Default)]
pub struct MarkupScan {
    /// Document type declaration, if any
    pub doctype: Option<Doctype>,
    /// `(id, line)` in document order, duplicates included
    pub ids: Vec<(String, usize)>,
    /// Outgoing references
    pub links: Vec<Link>,
    /// Named entity references that are not XML-predefined
    pub entities: Vec<EntityRef>,
    /// Lines of `<script>` elements
    pub scripts: Vec<usize>,
    /// Embedded CSS: `<style>` bodies and `style=` attributes
    pub css: Vec<CssFragment>,
    /// Number of `style=` attributes
    pub inline_style_count: usize,
    /// First well-formedness fault, if the document is not well-formed
    pub xml_fault: Option<XmlFault>,
}

impl MarkupScan {
    /// Scan a decoded content document.
    pub fn scan(text: &str) -> Self {
        let clean = strip_comments(text);
        let lines = LineIndex::new(&clean);
        let doctype = find_doctype(&clean);
        let body_start = doctype.as_ref().map(|d| d.end).unwrap_or(0);
        let mut scan = MarkupScan {
            xml_fault: check_well_formed(text),
            ..Default::default()
        };

        for tag in tags(&clean, body_start, &lines) {
            scan.record_tag(&clean, &tag, &lines);
        }

        let entity_text = blank_regions(&clean[body_start..], "<![CDATA[", "]]>");
        scan.entities = ENTITY_REF_RE
            .captures_iter(&entity_text)
            .filter(|c| !PREDEFINED_ENTITIES.contains(&&c[1]))
            .map(|c| EntityRef {
                name: c[1].to_string(),
                line: lines.line(body_start + c.get(0).map(|m| m.start()).unwrap_or(0)),
            })
            .collect();
        scan.doctype = doctype;
        scan
    }

    fn record_tag(&mut self, clean: &str, tag: &Tag, lines: &LineIndex) {
        for (key, value) in &tag.attributes {
            let local = key.rsplit(':').next().unwrap_or(key);
            match local {
                "id" if key == "id" || key == "xml:id" => {
                    self.ids.push((value.clone(), tag.line));
                }
                "href" => {
                    let kind = if matches!(tag.name.as_str(), "a" | "area") {
                        LinkKind::Hyperlink
                    } else {
                        LinkKind::Resource
                    };
                    self.push_link(value, tag.line, kind);
                }
                "src" => self.push_link(value, tag.line, LinkKind::Resource),
                "style" if key == "style" => {
                    self.inline_style_count += 1;
                    self.css.push(CssFragment {
                        text: value.clone(),
                        line: tag.line,
                        inline: true,
                    });
                }
                _ => {}
            }
        }

        match tag.name.as_str() {
            "script" => self.scripts.push(tag.line),
            "style" => {
                let body = &clean[tag.end..];
                let len = find_ascii_case_insensitive(body, "</style").unwrap_or(body.len());
                self.css.push(CssFragment {
                    text: body[..len].to_string(),
                    line: lines.line(tag.end),
                    inline: false,
                });
            }
            _ => {}
        }
    }

    fn push_link(&mut self, href: &str, line: usize, kind: LinkKind) {
        let href = href.trim();
        if href.is_empty() {
            return;
        }
        self.links.push(Link {
            href: href.to_string(),
            line,
            kind,
        });
    }
}

fn tags<'a>(
    clean: &'a str,
    from: usize,
    lines: &'a LineIndex,
) -> impl Iterator<Item = Tag> + 'a {
    TAG_RE.captures_iter(&clean[from..]).filter_map(move |caps| {
        let whole = caps.get(0)?;
        let raw_name = caps.get(1)?.as_str();
        let local = raw_name.rsplit(':').next().unwrap_or(raw_name);
        let attributes = caps
            .get(2)
            .map(|m| {
                ATTR_RE
                    .captures_iter(m.as_str())
                    .map(|a| {
                        let value = a.get(2).or_else(|| a.get(3)).map(|v| v.as_str()).unwrap_or("");
                        (a[1].to_string(), unescape_lossy(value))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Tag {
            name: local.to_ascii_lowercase(),
            attributes,
            line: lines.line(from + whole.start()),
            end: from + whole.end(),
        })
    })
}

/// Report the first XML well-formedness fault. Undefined named entities are
/// not faults here; the entity rule reports them with better context.
pub fn check_well_formed(text: &str) -> Option<XmlFault> {
    let content = text.as_bytes();
    let mut reader = reader(content);
    let mut buf = Vec::new();
    let mut open: Vec<String> = Vec::new();
    let mut seen_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                seen_root = true;
                open.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::Empty(_)) => seen_root = true,
            Ok(Event::End(_)) => {
                open.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                let offset = reader.buffer_position() as usize;
                return Some(XmlFault {
                    line: LineIndex::new(text).line(offset.min(text.len())),
                    message: e.to_string(),
                });
            }
            _ => {}
        }
        buf.clear();
    }

    if let Some(name) = open.last() {
        return Some(XmlFault {
            line: LineIndex::new(text).line(text.len()),
            message: format!("element <{}> is never closed", name),
        });
    }
    if !seen_root {
        return Some(XmlFault {
            line: 1,
            message: "document has no root element".to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_index() {
        let idx = LineIndex::new("a\nbc\n\nd");
        assert_eq!(idx.line(0), 1);
        assert_eq!(idx.line(1), 1);
        assert_eq!(idx.line(2), 2);
        assert_eq!(idx.line(5), 3);
        assert_eq!(idx.line(6), 4);
    }

    #[test]
    fn test_strip_comments_keeps_offsets() {
        let text = "a<!-- x\n<script> -->b";
        let clean = strip_comments(text);
        assert_eq!(clean.len(), text.len());
        assert!(!clean.contains("script"));
        assert_eq!(clean.matches('\n').count(), 1);
        assert!(clean.ends_with('b'));
    }

    #[test]
    fn test_unterminated_comment_runs_to_end() {
        let clean = strip_comments("<p>x</p><!-- <script>");
        assert!(!clean.contains("script"));
        assert!(clean.starts_with("<p>x</p>"));
    }

    #[test]
    fn test_doctype_internal_subset() {
        let text = r#"<?xml version="1.0"?>
<!DOCTYPE html [
  <!ENTITY nbsp "&#160;">
  <!ENTITY mdash "&#8212;">
]>
<html/>"#;
        let doctype = find_doctype(text).unwrap();
        assert_eq!(doctype.declared_entities, vec!["nbsp", "mdash"]);
        assert!(doctype.declares("nbsp"));
        assert!(!doctype.declares("hellip"));
        assert!(text[doctype.end..].trim_start().starts_with("<html"));
    }

    #[test]
    fn test_doctype_xhtml_dtd() {
        let text = r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.1//EN" "http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd"><html/>"#;
        let doctype = find_doctype(text).unwrap();
        assert!(doctype.defines_html_entities());
        assert!(doctype.declares("hellip"));
        assert!(doctype.internal_subset.is_none());
    }

    #[test]
    fn test_scan_ids_links_and_scripts() {
        let text = r#"<html><body>
<h1 id="intro">Intro</h1>
<p data-id="not-an-id"><a href="ch2.xhtml#s1">next</a> <img src="../img/a.png"/></p>
<!-- <p id="commented"><script>x</script></p> -->
<p>&lt;p id="escaped"&gt;</p>
<SCRIPT type="text/javascript">var a = 1;</SCRIPT>
</body></html>"#;
        let scan = MarkupScan::scan(text);
        assert_eq!(scan.ids, vec![("intro".to_string(), 2)]);
        assert_eq!(scan.links.len(), 2);
        assert_eq!(scan.links[0].href, "ch2.xhtml#s1");
        assert_eq!(scan.links[0].kind, LinkKind::Hyperlink);
        assert_eq!(scan.links[1].kind, LinkKind::Resource);
        assert_eq!(scan.scripts, vec![6]);
        assert!(scan.xml_fault.is_none());
    }

    #[test]
    fn test_scan_entities_skip_numeric_predefined_and_comments() {
        let text = "<html><body><p>a&nbsp;b &#160; &amp; &#x2014;</p>\n<!-- &mdash; -->\n<p>&hellip;</p><![CDATA[&copy;]]></body></html>";
        let scan = MarkupScan::scan(text);
        let names: Vec<(&str, usize)> = scan
            .entities
            .iter()
            .map(|e| (e.name.as_str(), e.line))
            .collect();
        assert_eq!(names, vec![("nbsp", 1), ("hellip", 3)]);
    }

    #[test]
    fn test_scan_css_fragments() {
        let text = "<html><head><style>\np { margin-top: 6em; }\n</style></head>\n<body><p style=\"position: absolute\">x</p></body></html>";
        let scan = MarkupScan::scan(text);
        assert_eq!(scan.css.len(), 2);
        assert!(!scan.css[0].inline);
        assert!(scan.css[0].text.contains("margin-top"));
        assert_eq!(scan.css[0].line, 1);
        assert!(scan.css[1].inline);
        assert_eq!(scan.css[1].line, 4);
        assert_eq!(scan.inline_style_count, 1);
    }

    #[test]
    fn test_well_formedness() {
        assert!(check_well_formed("<html><body><p>ok</p></body></html>").is_none());
        // Undefined entities are left to the entity rule
        assert!(check_well_formed("<html><body><p>a&nbsp;b</p></body></html>").is_none());

        let fault = check_well_formed("<html>\n<body>\n<p>bad</div>\n</body></html>").unwrap();
        assert_eq!(fault.line, 3);

        let fault = check_well_formed("<html><body>").unwrap();
        assert!(fault.message.contains("never closed"));
    }
}
