//! Small quick-xml helpers shared by the package and markup parsers.

use quick_xml::events::BytesStart;
use quick_xml::reader::Reader;

/// Build a reader the way every parser in this crate wants it.
pub(crate) fn reader(content: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);
    reader
}

/// Decode an element's local name (prefix stripped).
pub(crate) fn local_name(name: &[u8], reader: &Reader<&[u8]>) -> String {
    let name = reader
        .decoder()
        .decode(name)
        .map(|s| s.to_string())
        .unwrap_or_default();
    match name.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => name,
    }
}

/// Look up an attribute by its qualified name and return the unescaped value.
pub(crate) fn get_attribute(e: &BytesStart, reader: &Reader<&[u8]>, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        let key = reader.decoder().decode(attr.key.as_ref()).ok()?;
        if key.as_ref() == name {
            let value = reader.decoder().decode(&attr.value).ok()?;
            return Some(unescape_lossy(&value));
        }
    }
    None
}

/// All attributes as `(qualified name, unescaped value)` pairs.
pub(crate) fn attributes(e: &BytesStart, reader: &Reader<&[u8]>) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .filter_map(|attr| {
            let key = reader.decoder().decode(attr.key.as_ref()).ok()?.to_string();
            let value = reader.decoder().decode(&attr.value).ok()?;
            Some((key, unescape_lossy(&value)))
        })
        .collect()
}

/// Unescape XML entities, keeping the raw text if it contains references
/// quick-xml does not know.
pub(crate) fn unescape_lossy(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    quick_xml::escape::unescape(raw)
        .map(|s| s.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// 1-based line number of a byte offset.
pub(crate) fn line_at(content: &[u8], offset: usize) -> usize {
    let end = offset.min(content.len());
    1 + content[..end].iter().filter(|&&b| b == b'\n').count()
}
