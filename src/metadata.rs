//! Container pointer and package document parsing
//!
//! Parses `META-INF/container.xml` to find the package document, then
//! extracts the package version, Dublin Core metadata, `<meta>` properties
//! and the manifest from the OPF with quick-xml SAX-style parsing. The spine
//! is parsed separately by [`crate::spine`].

use quick_xml::events::Event;

use crate::error::EpubLintError;
use crate::path::{is_external, resolve_relative};
use crate::xml::{get_attribute, local_name, reader, unescape_lossy};

/// A single item in the manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestItem {
    /// Resource identifier
    pub id: String,
    /// Normalized archive path; empty if the href is empty, external or
    /// escapes the archive.
    pub href: String,
    /// The href exactly as written in the package document
    pub raw_href: String,
    /// MIME type
    pub media_type: String,
    /// Space-separated `properties` split into tokens
    pub properties: Vec<String>,
    /// Optional fallback item id
    pub fallback: Option<String>,
}

impl ManifestItem {
    /// Returns `true` if the item carries the given property token.
    pub fn has_property(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }

    /// XHTML or HTML content documents.
    pub fn is_content_document(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            "application/xhtml+xml" | "text/html"
        )
    }

    /// The modern navigation document.
    pub fn is_nav(&self) -> bool {
        self.has_property("nav")
    }

    /// The legacy NCX table of contents.
    pub fn is_ncx(&self) -> bool {
        self.media_type == "application/x-dtbncx+xml"
    }
}

/// Package-level metadata
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageMetadata {
    /// First `dc:title`
    pub title: Option<String>,
    /// Every `dc:creator`, in document order
    pub creators: Vec<String>,
    /// First non-empty `dc:language`
    pub language: Option<String>,
    /// The `dc:identifier` named by `unique-identifier`, else the first one
    pub identifier: Option<String>,
    /// `dcterms:modified`
    pub modified: Option<String>,
    /// `dc:publisher`
    pub publisher: Option<String>,
    /// `dc:date`
    pub date: Option<String>,
    /// Manifest id named by a legacy `<meta name="cover" content="...">`
    pub cover_meta: Option<String>,
    /// `rendition:layout` value
    pub rendition_layout: Option<String>,
    /// Every `<meta property>` and `<meta name>` key, in document order
    pub meta_properties: Vec<String>,
}

impl PackageMetadata {
    /// Returns `true` for `rendition:layout` = `pre-paginated`.
    pub fn is_fixed_layout(&self) -> bool {
        self.rendition_layout.as_deref() == Some("pre-paginated")
    }
}

/// Raw package document contents before cross-referencing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpfDocument {
    /// `package@version`
    pub version: String,
    /// Metadata section
    pub metadata: PackageMetadata,
    /// Manifest items in document order, duplicates included
    pub manifest: Vec<ManifestItem>,
}

/// Parse container.xml and return every rootfile `full-path`, in order.
pub fn parse_container_xml(content: &[u8]) -> Result<Vec<String>, EpubLintError> {
    let mut reader = reader(content);
    let mut buf = Vec::new();
    let mut rootfiles = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref(), &reader) == "rootfile" {
                    if let Some(path) = get_attribute(&e, &reader, "full-path") {
                        if !path.trim().is_empty() {
                            rootfiles.push(path);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EpubLintError::Parse(format!("XML parse error: {:?}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(rootfiles)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Other,
    Metadata,
    Manifest,
}

/// Parse the package document at `opf_path`.
///
/// Manifest hrefs are resolved against the package document's directory.
pub fn parse_opf(content: &[u8], opf_path: &str) -> Result<OpfDocument, EpubLintError> {
    let mut reader = reader(content);
    // Entity references split text events; trimming each piece would eat
    // the spaces around them.
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut doc = OpfDocument::default();

    let mut section = Section::Other;
    let mut unique_identifier: Option<String> = None;
    let mut identifiers: Vec<(Option<String>, String)> = Vec::new();
    // (element, id attribute, meta property) of the open metadata child
    let mut open: Option<(String, Option<String>, Option<String>)> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref(), &reader);
                match (section, name.as_str()) {
                    (_, "package") => {
                        doc.version = get_attribute(&e, &reader, "version").unwrap_or_default();
                        unique_identifier = get_attribute(&e, &reader, "unique-identifier");
                    }
                    (_, "metadata") => section = Section::Metadata,
                    (_, "manifest") => section = Section::Manifest,
                    (Section::Metadata, _) => {
                        let property = if name == "meta" {
                            record_meta(&e, &reader, &mut doc.metadata)
                        } else {
                            None
                        };
                        open = Some((name, get_attribute(&e, &reader, "id"), property));
                        text.clear();
                    }
                    (Section::Manifest, "item") => {
                        doc.manifest.push(parse_manifest_item(&e, &reader, opf_path));
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref(), &reader);
                match (section, name.as_str()) {
                    (Section::Metadata, "meta") => {
                        record_meta(&e, &reader, &mut doc.metadata);
                    }
                    (Section::Manifest, "item") => {
                        doc.manifest.push(parse_manifest_item(&e, &reader, opf_path));
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if open.is_some() {
                    let chunk = e
                        .decode()
                        .map_err(|e| EpubLintError::Parse(format!("Decode error: {:?}", e)))?;
                    text.push_str(&unescape_lossy(&chunk));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if open.is_some() {
                    let entity = e
                        .decode()
                        .map_err(|e| EpubLintError::Parse(format!("Decode error: {:?}", e)))?;
                    text.push_str(&unescape_lossy(&format!("&{};", entity)));
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref(), &reader);
                match name.as_str() {
                    "metadata" | "manifest" => section = Section::Other,
                    _ => {}
                }
                if let Some((element, id, property)) = open.take() {
                    if element == name {
                        let value = text.trim().to_string();
                        assign_metadata(
                            &mut doc.metadata,
                            &element,
                            property.as_deref(),
                            id,
                            value,
                            &mut identifiers,
                        );
                    } else {
                        open = Some((element, id, property));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EpubLintError::Parse(format!("XML parse error: {:?}", e))),
            _ => {}
        }
        buf.clear();
    }

    doc.metadata.identifier = unique_identifier
        .as_deref()
        .and_then(|uid| {
            identifiers
                .iter()
                .find(|(id, _)| id.as_deref() == Some(uid))
                .map(|(_, value)| value.clone())
        })
        .or_else(|| identifiers.first().map(|(_, value)| value.clone()));

    Ok(doc)
}

/// Record attribute-level facts of a `<meta>` element and return its
/// `property`, if any.
fn record_meta(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &quick_xml::reader::Reader<&[u8]>,
    metadata: &mut PackageMetadata,
) -> Option<String> {
    let name = get_attribute(e, reader, "name");
    let content = get_attribute(e, reader, "content");
    let property = get_attribute(e, reader, "property");

    if let Some(name) = &name {
        if name == "cover" {
            metadata.cover_meta = content.clone();
        }
        metadata.meta_properties.push(name.clone());
    }
    if let Some(property) = &property {
        metadata.meta_properties.push(property.clone());
        // Empty-element form with content attribute
        if let Some(content) = &content {
            apply_meta_property(metadata, property, content);
        }
    }
    property
}

fn apply_meta_property(metadata: &mut PackageMetadata, property: &str, value: &str) {
    match property {
        "dcterms:modified" => metadata.modified = Some(value.to_string()),
        "rendition:layout" => metadata.rendition_layout = Some(value.to_string()),
        _ => {}
    }
}

fn assign_metadata(
    metadata: &mut PackageMetadata,
    element: &str,
    property: Option<&str>,
    id: Option<String>,
    value: String,
    identifiers: &mut Vec<(Option<String>, String)>,
) {
    if value.is_empty() {
        return;
    }
    match element {
        "meta" => {
            if let Some(property) = property {
                apply_meta_property(metadata, property, &value);
            }
        }
        "title" if metadata.title.is_none() => metadata.title = Some(value),
        "creator" => metadata.creators.push(value),
        "language" if metadata.language.is_none() => metadata.language = Some(value),
        "publisher" if metadata.publisher.is_none() => metadata.publisher = Some(value),
        "date" if metadata.date.is_none() => metadata.date = Some(value),
        "identifier" => identifiers.push((id, value)),
        _ => {}
    }
}

/// Parse a manifest item from XML element attributes
fn parse_manifest_item(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &quick_xml::reader::Reader<&[u8]>,
    opf_path: &str,
) -> ManifestItem {
    let raw_href = get_attribute(e, reader, "href").unwrap_or_default();
    let href = if raw_href.trim().is_empty() || is_external(&raw_href) {
        String::new()
    } else {
        resolve_relative(opf_path, &raw_href).unwrap_or_default()
    };
    ManifestItem {
        id: get_attribute(e, reader, "id").unwrap_or_default(),
        href,
        raw_href,
        media_type: get_attribute(e, reader, "media-type").unwrap_or_default(),
        properties: get_attribute(e, reader, "properties")
            .map(|p| p.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        fallback: get_attribute(e, reader, "fallback"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPF: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<package version="3.0" unique-identifier="bookid" xmlns="http://www.idpf.org/2007/opf">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>A &amp; B</dc:title>
    <dc:creator>First Author</dc:creator>
    <dc:creator>Second Author</dc:creator>
    <dc:identifier id="other">isbn:123</dc:identifier>
    <dc:identifier id="bookid">urn:uuid:abc</dc:identifier>
    <dc:language>en-US</dc:language>
    <meta property="dcterms:modified">2024-01-01T00:00:00Z</meta>
    <meta property="rendition:layout">pre-paginated</meta>
    <meta property="ibooks:specified-fonts">true</meta>
    <meta name="cover" content="cover-img"/>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav scripted"/>
    <item id="c1" href="text/ch%201.xhtml" media-type="application/xhtml+xml"/>
    <item id="cover-img" href="../images/cover.jpg" media-type="image/jpeg"/>
    <item id="ext" href="https://example.com/x.css" media-type="text/css"/>
  </manifest>
  <spine><itemref idref="c1"/></spine>
</package>"#;

    #[test]
    fn test_parse_container_xml_lists_rootfiles() {
        let container = br#"<container><rootfiles>
            <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
            <rootfile full-path="alt/other.opf" media-type="application/oebps-package+xml"/>
        </rootfiles></container>"#;
        let rootfiles = parse_container_xml(container).unwrap();
        assert_eq!(rootfiles, vec!["OEBPS/content.opf", "alt/other.opf"]);
    }

    #[test]
    fn test_parse_container_xml_without_rootfile() {
        let rootfiles = parse_container_xml(b"<container><rootfiles/></container>").unwrap();
        assert!(rootfiles.is_empty());
    }

    #[test]
    fn test_parse_container_xml_malformed() {
        assert!(parse_container_xml(b"<container><rootfiles></container>").is_err());
    }

    #[test]
    fn test_parse_opf_metadata() {
        let doc = parse_opf(OPF, "OEBPS/content.opf").unwrap();
        assert_eq!(doc.version, "3.0");
        let md = &doc.metadata;
        assert_eq!(md.title.as_deref(), Some("A & B"));
        assert_eq!(md.creators, vec!["First Author", "Second Author"]);
        assert_eq!(md.language.as_deref(), Some("en-US"));
        assert_eq!(md.identifier.as_deref(), Some("urn:uuid:abc"));
        assert_eq!(md.modified.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert!(md.is_fixed_layout());
        assert_eq!(md.cover_meta.as_deref(), Some("cover-img"));
        assert!(md
            .meta_properties
            .iter()
            .any(|p| p == "ibooks:specified-fonts"));
    }

    #[test]
    fn test_parse_opf_manifest_resolution() {
        let doc = parse_opf(OPF, "OEBPS/content.opf").unwrap();
        assert_eq!(doc.manifest.len(), 4);
        let nav = &doc.manifest[0];
        assert!(nav.is_nav());
        assert!(nav.has_property("scripted"));
        assert_eq!(nav.href, "OEBPS/nav.xhtml");
        assert_eq!(doc.manifest[1].href, "OEBPS/text/ch 1.xhtml");
        assert_eq!(doc.manifest[2].href, "images/cover.jpg");
        assert_eq!(doc.manifest[3].href, "");
        assert_eq!(doc.manifest[3].raw_href, "https://example.com/x.css");
    }

    #[test]
    fn test_parse_opf_missing_language() {
        let opf = br#"<package version="2.0"><metadata><dc:title>T</dc:title></metadata><manifest/></package>"#;
        let doc = parse_opf(opf, "content.opf").unwrap();
        assert_eq!(doc.version, "2.0");
        assert!(doc.metadata.language.is_none());
    }

    #[test]
    fn test_parse_opf_malformed() {
        let opf = b"<package><metadata></package>";
        assert!(matches!(
            parse_opf(opf, "content.opf"),
            Err(EpubLintError::Parse(_))
        ));
    }
}
