//! CSS declaration scanner
//!
//! The content rules only need `property: value` pairs with line numbers,
//! not a cascade. Stylesheets are scanned block by block after comments are
//! blanked out, and a property name is always matched as a whole token so
//! `text-transform` is never mistaken for `transform`.
//!
//! Segments ending in `{` are selectors (or at-rule preludes) and are
//! skipped; segments ending in `;` or `}` inside a block are declarations.

use crate::error::EpubLintError;
use crate::markup::{blank_regions, LineIndex};

/// A single `property: value` declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct Declaration {
    /// Lower-cased property name as written (vendor prefix kept)
    pub property: String,
    /// Raw value, trimmed, `!important` kept
    pub value: String,
    /// 1-based line of the property name
    pub line: usize,
}

impl Declaration {
    /// Property name without a vendor prefix (`-webkit-transform` ->
    /// `transform`).
    pub fn base_property(&self) -> &str {
        for prefix in ["-webkit-", "-moz-", "-ms-", "-o-", "-epub-"] {
            if let Some(rest) = self.property.strip_prefix(prefix) {
                return rest;
            }
        }
        &self.property
    }

    /// Top and bottom margin in em/rem, if this declaration sets either.
    /// Values in other units are ignored.
    pub fn vertical_margins_em(&self) -> Vec<f32> {
        let parts: Vec<&str> = self.value.split_whitespace().collect();
        let picked: Vec<&str> = match self.base_property() {
            "margin-top" | "margin-bottom" | "margin-block-start" | "margin-block-end" => {
                parts.first().copied().into_iter().collect()
            }
            "margin-block" => parts.iter().take(2).copied().collect(),
            "margin" => match parts.len() {
                0 => Vec::new(),
                1 | 2 => vec![parts[0]],
                _ => vec![parts[0], parts[2]],
            },
            _ => Vec::new(),
        };
        picked.into_iter().filter_map(length_em).collect()
    }

    /// `position: absolute` or `position: fixed`.
    pub fn positioning(&self) -> Option<&str> {
        if self.base_property() != "position" {
            return None;
        }
        let value = self.value.trim_end_matches("!important").trim();
        ["absolute", "fixed"]
            .into_iter()
            .find(|p| value.eq_ignore_ascii_case(p))
    }

    /// Returns `true` if the value uses `vw`, `vh`, `vmin` or `vmax`.
    pub fn uses_viewport_units(&self) -> bool {
        let bytes = self.value.as_bytes();
        let lower = self.value.to_ascii_lowercase();
        ["vmin", "vmax", "vw", "vh"].iter().any(|unit| {
            lower.match_indices(unit).any(|(i, _)| {
                let digit_before = i > 0 && bytes[i - 1].is_ascii_digit();
                let end = i + unit.len();
                let boundary_after = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
                digit_before && boundary_after
            })
        })
    }
}

/// Parse a length in `em` or `rem` into a number of ems.
pub fn length_em(token: &str) -> Option<f32> {
    let token = token.trim().trim_end_matches("!important").trim().to_ascii_lowercase();
    let number = token
        .strip_suffix("rem")
        .or_else(|| token.strip_suffix("em"))?;
    number.trim().parse::<f32>().ok()
}

/// Scan a stylesheet for declarations.
///
/// Fails on an unclosed rule block; a stylesheet cut off mid-block is
/// treated as unreadable rather than guessed at.
pub fn parse_stylesheet(css: &str) -> Result<Vec<Declaration>, EpubLintError> {
    let clean = blank_regions(css, "/*", "*/");
    let lines = LineIndex::new(&clean);
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut segment_start = 0;

    for (i, b) in clean.bytes().enumerate() {
        match b {
            b'{' => {
                depth += 1;
                segment_start = i + 1;
            }
            b';' | b'}' => {
                if depth > 0 {
                    push_declaration(&clean, segment_start, i, &lines, 0, &mut out);
                }
                if b == b'}' {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        EpubLintError::Parse(format!(
                            "Unexpected '}}' on line {}",
                            lines.line(i)
                        ))
                    })?;
                }
                segment_start = i + 1;
            }
            _ => {}
        }
    }

    if depth > 0 {
        return Err(EpubLintError::Parse("Unclosed CSS rule block".into()));
    }
    Ok(out)
}

/// Scan a `style` attribute value. `first_line` is the line the attribute
/// sits on.
pub fn parse_inline_style(style: &str, first_line: usize) -> Vec<Declaration> {
    let clean = blank_regions(style, "/*", "*/");
    let lines = LineIndex::new(&clean);
    let offset = first_line.saturating_sub(1);
    let mut out = Vec::new();
    let mut segment_start = 0;
    for (i, b) in clean.bytes().enumerate() {
        if b == b';' {
            push_declaration(&clean, segment_start, i, &lines, offset, &mut out);
            segment_start = i + 1;
        }
    }
    push_declaration(&clean, segment_start, clean.len(), &lines, offset, &mut out);
    out
}

fn push_declaration(
    css: &str,
    start: usize,
    end: usize,
    lines: &LineIndex,
    line_offset: usize,
    out: &mut Vec<Declaration>,
) {
    let segment = &css[start..end];
    let Some(colon) = segment.find(':') else {
        return;
    };
    let property = segment[..colon].trim();
    if !is_property_name(property) {
        return;
    }
    let value = segment[colon + 1..].trim();
    let leading = segment.len() - segment.trim_start().len();
    out.push(Declaration {
        property: property.to_ascii_lowercase(),
        value: value.to_string(),
        line: line_offset + lines.line(start + leading),
    });
}

fn is_property_name(name: &str) -> bool {
    let name = name.strip_prefix('-').unwrap_or(name);
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(decls: &[Declaration]) -> Vec<&str> {
        decls.iter().map(|d| d.property.as_str()).collect()
    }

    #[test]
    fn test_text_transform_is_not_transform() {
        let decls = parse_stylesheet("h1 { text-transform: uppercase; }").unwrap();
        assert_eq!(props(&decls), vec!["text-transform"]);
        assert_eq!(decls[0].base_property(), "text-transform");
    }

    #[test]
    fn test_declarations_with_lines() {
        let css = "/* transform: rotate(1deg); */\np {\n  margin-top: 6em;\n  -webkit-transform: rotate(45deg)\n}\na:hover { color: red }";
        let decls = parse_stylesheet(css).unwrap();
        assert_eq!(props(&decls), vec!["margin-top", "-webkit-transform", "color"]);
        assert_eq!(decls[0].line, 3);
        assert_eq!(decls[1].line, 4);
        assert_eq!(decls[1].base_property(), "transform");
        assert_eq!(decls[2].line, 6);
    }

    #[test]
    fn test_nested_at_rules() {
        let css = "@import url(x.css);\n@media screen { p { position: fixed; } }";
        let decls = parse_stylesheet(css).unwrap();
        assert_eq!(props(&decls), vec!["position"]);
        assert_eq!(decls[0].positioning(), Some("fixed"));
    }

    #[test]
    fn test_unclosed_block_fails() {
        assert!(parse_stylesheet("p { color: red;").is_err());
        assert!(parse_stylesheet("p { color: red; } }").is_err());
    }

    #[test]
    fn test_vertical_margins() {
        let decls = parse_inline_style("margin: 1em 2em 7em; margin-top: 3rem; margin-left: 9em", 1);
        assert_eq!(decls[0].vertical_margins_em(), vec![1.0, 7.0]);
        assert_eq!(decls[1].vertical_margins_em(), vec![3.0]);
        assert!(decls[2].vertical_margins_em().is_empty());
        let px = parse_inline_style("margin-top: 80px", 1);
        assert!(px[0].vertical_margins_em().is_empty());
    }

    #[test]
    fn test_viewport_units() {
        let decls = parse_inline_style("width: 50vw; height: 100%; font-size: 2vmin; content: 'vw'", 4);
        let flags: Vec<bool> = decls.iter().map(Declaration::uses_viewport_units).collect();
        assert_eq!(flags, vec![true, false, true, false]);
        assert!(decls.iter().all(|d| d.line == 4));
    }

    #[test]
    fn test_length_em() {
        assert_eq!(length_em("5em"), Some(5.0));
        assert_eq!(length_em("2.5REM !important"), Some(2.5));
        assert_eq!(length_em("10px"), None);
        assert_eq!(length_em("auto"), None);
    }
}
