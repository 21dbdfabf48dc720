//! Archive path normalization and href resolution
//!
//! Every path that crosses the archive boundary goes through
//! [`normalize_archive_path`]. Unlike lenient path joining, a `..` that would
//! climb above the archive root is an error rather than being clamped.

use crate::error::ArchiveError;

/// Normalize a raw ZIP entry name or requested path into a logical,
/// archive-relative path.
///
/// Backslashes are treated as separators, `.` and empty segments are dropped
/// and `..` pops the previous segment. Absolute paths, drive or volume
/// prefixes and any `..` that would leave the root are refused.
pub fn normalize_archive_path(raw: &str) -> Result<String, ArchiveError> {
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) || unified.contains('\0') {
        return Err(ArchiveError::PathEscape(raw.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(ArchiveError::PathEscape(raw.to_string()));
                }
            }
            _ => parts.push(part),
        }
    }
    Ok(parts.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Directory part of a logical path (`""` for root-level entries).
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Resolve `href` relative to the document at `base_path`.
///
/// The fragment is not part of the result; use [`split_fragment`] first when
/// it matters. Returns `None` if the target escapes the archive root.
pub fn resolve_relative(base_path: &str, href: &str) -> Option<String> {
    let (path, _) = split_fragment(href);
    let path = percent_decode(path);
    if path.is_empty() {
        return Some(base_path.to_string());
    }
    if let Some(rooted) = path.strip_prefix('/') {
        return normalize_archive_path(rooted).ok();
    }
    let base_dir = parent_dir(base_path);
    if base_dir.is_empty() {
        normalize_archive_path(&path).ok()
    } else {
        normalize_archive_path(&format!("{}/{}", base_dir, path)).ok()
    }
}

/// Split an href into its path and optional fragment.
pub fn split_fragment(href: &str) -> (&str, Option<&str>) {
    match href.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (href, None),
    }
}

/// Returns `true` if the href starts with a URI scheme (`http:`, `mailto:`,
/// `data:` ...) and therefore points outside the archive.
pub fn is_external(href: &str) -> bool {
    let Some((scheme, _)) = href.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    // A single letter is a drive letter, not a scheme.
    scheme.len() > 1
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
}

/// Decode `%XX` escapes. Malformed escapes are kept verbatim.
pub fn percent_decode(input: &str) -> String {
    if !input.contains('%') {
        return input.to_string();
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_simple_paths() {
        assert_eq!(
            normalize_archive_path("OEBPS/./text/ch1.xhtml").unwrap(),
            "OEBPS/text/ch1.xhtml"
        );
        assert_eq!(
            normalize_archive_path("OEBPS/text/../images/a.png").unwrap(),
            "OEBPS/images/a.png"
        );
        assert_eq!(normalize_archive_path("a//b").unwrap(), "a/b");
    }

    #[test]
    fn test_normalize_rejects_escapes() {
        for raw in [
            "../../etc/passwd",
            "OEBPS/../../secret",
            "/etc/passwd",
            "C:/Windows/system.ini",
            "..\\..\\boot.ini",
        ] {
            assert!(
                matches!(normalize_archive_path(raw), Err(ArchiveError::PathEscape(_))),
                "{} should be refused",
                raw
            );
        }
    }

    #[test]
    fn test_resolve_relative_to_document() {
        assert_eq!(
            resolve_relative("OEBPS/text/ch1.xhtml", "ch2.xhtml#s1").as_deref(),
            Some("OEBPS/text/ch2.xhtml")
        );
        assert_eq!(
            resolve_relative("OEBPS/text/ch1.xhtml", "../images/My%20Cover.jpg").as_deref(),
            Some("OEBPS/images/My Cover.jpg")
        );
        assert_eq!(
            resolve_relative("ch1.xhtml", "#top").as_deref(),
            Some("ch1.xhtml")
        );
        assert_eq!(resolve_relative("ch1.xhtml", "../../x.xhtml"), None);
    }

    #[test]
    fn test_external_detection() {
        assert!(is_external("https://example.com"));
        assert!(is_external("mailto:someone@example.com"));
        assert!(is_external("data:image/png;base64,AAAA"));
        assert!(!is_external("chapter1.xhtml"));
        assert!(!is_external("#note-1"));
        assert!(!is_external("c:foo"));
    }

    #[test]
    fn test_percent_decode_keeps_malformed_escapes() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
