//! Content rule engine
//!
//! Platform heuristics over markup and stylesheets. Each rule is a plain
//! descriptor: target media types, a detection function, the affected
//! platform, severity and spec reference. [`ContentRules`] is constructed
//! from an explicit table and evaluates it document by document; one rule
//! failing on one document becomes a warning and never stops the others.
//!
//! Detection works on [`MarkupScan`] output, which is already taken from
//! comment-blanked text, so commented-out examples never match.

use std::sync::LazyLock;

use log::{debug, warn};
use regex::Regex;

use crate::check::{par_map, Check, CheckContext, DocumentOutcome};
use crate::css::{parse_inline_style, parse_stylesheet, Declaration};
use crate::diagnostic::{Diagnostic, Platform, Severity};
use crate::error::RuleError;
use crate::markup::{Doctype, MarkupScan};

/// Media type of XHTML content documents.
pub const MEDIA_XHTML: &str = "application/xhtml+xml";
/// Media type of stylesheets.
pub const MEDIA_CSS: &str = "text/css";

const MARKUP_ONLY: &[&str] = &[MEDIA_XHTML];
const MARKUP_AND_CSS: &[&str] = &[MEDIA_XHTML, MEDIA_CSS];

/// Simplified BCP-47 language-tag grammar: primary language, optional
/// extlang, script, region, variants, extensions and private use.
static BCP47_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:[A-Za-z]{2,3}(?:-[A-Za-z]{3}){0,3}|[A-Za-z]{4,8})(?:-[A-Za-z]{4})?(?:-(?:[A-Za-z]{2}|[0-9]{3}))?(?:-(?:[A-Za-z0-9]{5,8}|[0-9][A-Za-z0-9]{3}))*(?:-[0-9A-WY-Za-wy-z](?:-[A-Za-z0-9]{2,8})+)*(?:-[Xx](?:-[A-Za-z0-9]{1,8})+)?|[Xx](?:-[A-Za-z0-9]{1,8})+)$",
    )
    .expect("valid language tag regex")
});

/// Empirical limits used by the content and resource rules.
///
/// The margin and image numbers come from observed reader behaviour rather
/// than any specification, so they are configurable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RuleThresholds {
    /// Vertical margin (em) above which a warning is raised
    pub margin_warn_em: f32,
    /// Vertical margin (em) at or above which an error is raised
    pub margin_error_em: f32,
    /// Inline `style=` attributes per document before Kindle conversion
    /// gets slow
    pub inline_style_limit: usize,
    /// Image size (bytes) worth a warning
    pub image_warn_bytes: u64,
    /// Image size (bytes) considered large
    pub image_large_bytes: u64,
    /// Maximum comfortable image width in pixels
    pub image_max_width: u32,
    /// Maximum comfortable image height in pixels
    pub image_max_height: u32,
    /// Minimum cover width in pixels
    pub cover_min_width: u32,
    /// Minimum cover height in pixels
    pub cover_min_height: u32,
    /// Archive size (bytes) worth a warning
    pub archive_warn_bytes: u64,
    /// Kindle delivery limit (bytes)
    pub archive_kindle_bytes: u64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            margin_warn_em: 3.0,
            margin_error_em: 5.0,
            inline_style_limit: 10,
            image_warn_bytes: 2 * 1024 * 1024,
            image_large_bytes: 5 * 1024 * 1024,
            image_max_width: 3000,
            image_max_height: 4000,
            cover_min_width: 300,
            cover_min_height: 400,
            archive_warn_bytes: 100 * 1024 * 1024,
            archive_kindle_bytes: 650 * 1024 * 1024,
        }
    }
}

impl RuleThresholds {
    /// Set the margin warning and error bands (em).
    pub fn with_margins(mut self, warn_em: f32, error_em: f32) -> Self {
        self.margin_warn_em = warn_em;
        self.margin_error_em = error_em;
        self
    }

    /// Set the inline style attribute limit.
    pub fn with_inline_style_limit(mut self, limit: usize) -> Self {
        self.inline_style_limit = limit;
        self
    }

    /// Set the image size thresholds (bytes).
    pub fn with_image_bytes(mut self, warn: u64, large: u64) -> Self {
        self.image_warn_bytes = warn;
        self.image_large_bytes = large;
        self
    }

    /// Set the maximum comfortable image dimensions.
    pub fn with_image_dimensions(mut self, width: u32, height: u32) -> Self {
        self.image_max_width = width;
        self.image_max_height = height;
        self
    }

    /// Set the minimum cover dimensions.
    pub fn with_cover_minimum(mut self, width: u32, height: u32) -> Self {
        self.cover_min_width = width;
        self.cover_min_height = height;
        self
    }

    /// Set the archive size thresholds (bytes).
    pub fn with_archive_bytes(mut self, warn: u64, kindle: u64) -> Self {
        self.archive_warn_bytes = warn;
        self.archive_kindle_bytes = kindle;
        self
    }
}

/// What a rule sees of one document.
pub struct RuleInput<'a> {
    /// Archive path
    pub path: &'a str,
    /// [`MEDIA_XHTML`] or [`MEDIA_CSS`]
    pub media_type: &'static str,
    /// Markup scan; `None` for stylesheets
    pub scan: Option<&'a MarkupScan>,
    declarations: Result<Vec<Declaration>, String>,
}

impl<'a> RuleInput<'a> {
    /// Input for a scanned content document. Embedded `<style>` blocks and
    /// `style=` attributes supply the declarations.
    pub fn markup(path: &'a str, scan: &'a MarkupScan) -> Self {
        Self {
            path,
            media_type: MEDIA_XHTML,
            scan: Some(scan),
            declarations: embedded_declarations(scan),
        }
    }

    /// Input for a stylesheet.
    pub fn stylesheet(path: &'a str, css: &str) -> Self {
        Self {
            path,
            media_type: MEDIA_CSS,
            scan: None,
            declarations: parse_stylesheet(css).map_err(|err| err.to_string()),
        }
    }

    /// CSS declarations, or the reason they could not be read.
    pub fn declarations(&self, rule: &'static str) -> Result<&[Declaration], RuleError> {
        self.declarations.as_deref().map_err(|reason| RuleError {
            rule,
            path: self.path.to_string(),
            reason: reason.clone(),
        })
    }
}

fn embedded_declarations(scan: &MarkupScan) -> Result<Vec<Declaration>, String> {
    let mut out = Vec::new();
    for fragment in &scan.css {
        if fragment.inline {
            out.extend(parse_inline_style(&fragment.text, fragment.line));
            continue;
        }
        let offset = fragment.line.saturating_sub(1);
        let block = parse_stylesheet(&fragment.text)
            .map_err(|err| format!("<style> on line {}: {}", fragment.line, err))?;
        out.extend(block.into_iter().map(|mut decl| {
            decl.line += offset;
            decl
        }));
    }
    Ok(out)
}

/// One match reported by a rule's detector.
#[derive(Clone, Debug, PartialEq)]
pub struct Finding {
    /// Message
    pub message: String,
    /// 1-based line, when the match has one
    pub line: Option<usize>,
    /// Overrides the rule's severity (severity bands)
    pub severity: Option<Severity>,
    /// Remediation hint
    pub hint: Option<String>,
}

impl Finding {
    /// New finding with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            severity: None,
            hint: None,
        }
    }

    /// Attach a line.
    pub fn line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    /// Override the severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Attach a hint.
    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Detection function of a rule.
pub type Detector = fn(&RuleInput<'_>, &RuleThresholds) -> Result<Vec<Finding>, RuleError>;

/// A content rule descriptor.
#[derive(Clone, Copy)]
pub struct ContentRule {
    /// Diagnostic code
    pub code: &'static str,
    /// Media types the rule runs on
    pub targets: &'static [&'static str],
    /// Affected platform
    pub platform: Platform,
    /// Default severity
    pub severity: Severity,
    /// Spec reference, if any
    pub spec_ref: Option<&'static str>,
    /// Detection function
    pub detect: Detector,
}

impl ContentRule {
    /// Returns `true` if the rule runs on `media_type`.
    pub fn applies_to(&self, media_type: &str) -> bool {
        self.targets.contains(&media_type)
    }

    /// Run the rule on one input. A detector failure becomes a single
    /// warning naming the rule and the document.
    pub fn evaluate(&self, input: &RuleInput<'_>, thresholds: &RuleThresholds) -> Vec<Diagnostic> {
        match (self.detect)(input, thresholds) {
            Ok(findings) => findings
                .into_iter()
                .map(|finding| self.to_diagnostic(input.path, finding))
                .collect(),
            Err(err) => {
                warn!("[CHECK] {}", err);
                vec![Diagnostic::warning(
                    "RULE_EVALUATION_FAILED",
                    format!(
                        "Could not evaluate rule {} on '{}': {}",
                        err.rule, err.path, err.reason
                    ),
                )
                .at(input.path)]
            }
        }
    }

    fn to_diagnostic(&self, path: &str, finding: Finding) -> Diagnostic {
        let mut d = Diagnostic::new(
            self.code,
            finding.severity.unwrap_or(self.severity),
            finding.message,
        )
        .on(self.platform);
        d = match finding.line {
            Some(line) => d.at_line(path, line),
            None => d.at(path),
        };
        if let Some(spec) = self.spec_ref {
            d = d.spec(spec);
        }
        if let Some(hint) = finding.hint {
            d = d.hint(hint);
        }
        d
    }
}

impl std::fmt::Debug for ContentRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentRule")
            .field("code", &self.code)
            .field("platform", &self.platform)
            .field("severity", &self.severity)
            .finish()
    }
}

/// The built-in rule table, in evaluation order.
pub fn default_rules() -> Vec<ContentRule> {
    vec![
        ContentRule {
            code: "ENTITY_UNDECLARED",
            targets: MARKUP_ONLY,
            platform: Platform::AppleBooks,
            severity: Severity::Error,
            spec_ref: Some("XML 1.0 § 4.1"),
            detect: detect_undeclared_entities,
        },
        ContentRule {
            code: "XHTML_MALFORMED",
            targets: MARKUP_ONLY,
            platform: Platform::AppleBooks,
            severity: Severity::Error,
            spec_ref: Some("EPUB 3.3 § 6.1.2"),
            detect: detect_malformed,
        },
        ContentRule {
            code: "SCRIPT_EMBEDDED",
            targets: MARKUP_ONLY,
            platform: Platform::General,
            severity: Severity::Warn,
            spec_ref: Some("EPUB 3.3 § 7.3"),
            detect: detect_scripts,
        },
        ContentRule {
            code: "CSS_TRANSFORM",
            targets: MARKUP_AND_CSS,
            platform: Platform::Eink,
            severity: Severity::Error,
            spec_ref: None,
            detect: detect_transforms,
        },
        ContentRule {
            code: "CSS_LARGE_MARGIN",
            targets: MARKUP_AND_CSS,
            platform: Platform::Eink,
            severity: Severity::Warn,
            spec_ref: None,
            detect: detect_large_margins,
        },
        ContentRule {
            code: "CSS_POSITIONING",
            targets: MARKUP_AND_CSS,
            platform: Platform::Eink,
            severity: Severity::Warn,
            spec_ref: None,
            detect: detect_positioning,
        },
        ContentRule {
            code: "CSS_VIEWPORT_UNITS",
            targets: MARKUP_AND_CSS,
            platform: Platform::Eink,
            severity: Severity::Warn,
            spec_ref: None,
            detect: detect_viewport_units,
        },
        ContentRule {
            code: "INLINE_STYLES_EXCESSIVE",
            targets: MARKUP_ONLY,
            platform: Platform::Kindle,
            severity: Severity::Warn,
            spec_ref: None,
            detect: detect_inline_styles,
        },
    ]
}

/// Common named entities and their code points.
fn numeric_reference(name: &str) -> Option<u32> {
    Some(match name {
        "nbsp" => 160,
        "shy" => 173,
        "copy" => 169,
        "reg" => 174,
        "laquo" => 171,
        "raquo" => 187,
        "ndash" => 8211,
        "mdash" => 8212,
        "lsquo" => 8216,
        "rsquo" => 8217,
        "ldquo" => 8220,
        "rdquo" => 8221,
        "hellip" => 8230,
        "trade" => 8482,
        "euro" => 8364,
        _ => return None,
    })
}

fn detect_undeclared_entities(
    input: &RuleInput<'_>,
    _: &RuleThresholds,
) -> Result<Vec<Finding>, RuleError> {
    let Some(scan) = input.scan else {
        return Ok(Vec::new());
    };
    let doctype = scan.doctype.as_ref();
    if doctype.is_some_and(Doctype::defines_html_entities) {
        return Ok(Vec::new());
    }

    // (name, first line, occurrences)
    let mut groups: Vec<(&str, usize, usize)> = Vec::new();
    for entity in &scan.entities {
        if doctype.is_some_and(|d| d.declares(&entity.name)) {
            continue;
        }
        match groups.iter_mut().find(|g| g.0 == entity.name) {
            Some(group) => group.2 += 1,
            None => groups.push((&entity.name, entity.line, 1)),
        }
    }

    Ok(groups
        .into_iter()
        .map(|(name, line, count)| {
            let finding = Finding::new(format!(
                "Undeclared entity '&{};' ({} occurrence{}) - strict XML parsers refuse the document.",
                name,
                count,
                if count == 1 { "" } else { "s" }
            ))
            .line(line);
            match numeric_reference(name) {
                Some(code) => finding.hint(format!("Replace '&{};' with '&#{};'.", name, code)),
                None => finding.hint(
                    "Use a numeric character reference or declare the entity in the DOCTYPE.",
                ),
            }
        })
        .collect())
}

fn detect_malformed(input: &RuleInput<'_>, _: &RuleThresholds) -> Result<Vec<Finding>, RuleError> {
    Ok(input
        .scan
        .and_then(|scan| scan.xml_fault.as_ref())
        .map(|fault| {
            Finding::new(format!("XHTML is not well-formed: {}", fault.message)).line(fault.line)
        })
        .into_iter()
        .collect())
}

fn detect_scripts(input: &RuleInput<'_>, _: &RuleThresholds) -> Result<Vec<Finding>, RuleError> {
    let Some(&first) = input.scan.and_then(|scan| scan.scripts.first()) else {
        return Ok(Vec::new());
    };
    let count = input.scan.map_or(0, |scan| scan.scripts.len());
    Ok(vec![Finding::new(format!(
        "Document contains {} <script> element{}; scripting support varies between readers.",
        count,
        if count == 1 { "" } else { "s" }
    ))
    .line(first)
    .hint("Keep the content readable with scripting disabled.")])
}

fn detect_transforms(input: &RuleInput<'_>, _: &RuleThresholds) -> Result<Vec<Finding>, RuleError> {
    Ok(input
        .declarations("CSS_TRANSFORM")?
        .iter()
        .filter(|decl| decl.base_property() == "transform")
        .map(|decl| {
            Finding::new(format!(
                "CSS '{}: {}' is not supported by e-ink readers.",
                decl.property, decl.value
            ))
            .line(decl.line)
            .hint("Rotate or scale the source image instead of using CSS transforms.")
        })
        .collect())
}

fn detect_large_margins(
    input: &RuleInput<'_>,
    thresholds: &RuleThresholds,
) -> Result<Vec<Finding>, RuleError> {
    let mut out = Vec::new();
    for decl in input.declarations("CSS_LARGE_MARGIN")? {
        let Some(largest) = decl
            .vertical_margins_em()
            .into_iter()
            .reduce(f32::max)
        else {
            continue;
        };
        let severity = if largest >= thresholds.margin_error_em {
            Severity::Error
        } else if largest > thresholds.margin_warn_em {
            Severity::Warn
        } else {
            continue;
        };
        out.push(
            Finding::new(format!(
                "Large vertical margin '{}: {}' ({}em) wastes screen space on e-ink readers.",
                decl.property, decl.value, largest
            ))
            .line(decl.line)
            .severity(severity),
        );
    }
    Ok(out)
}

fn detect_positioning(input: &RuleInput<'_>, _: &RuleThresholds) -> Result<Vec<Finding>, RuleError> {
    Ok(input
        .declarations("CSS_POSITIONING")?
        .iter()
        .filter_map(|decl| {
            decl.positioning().map(|kind| {
                Finding::new(format!(
                    "'position: {}' is unreliable on e-ink readers.",
                    kind
                ))
                .line(decl.line)
            })
        })
        .collect())
}

fn detect_viewport_units(
    input: &RuleInput<'_>,
    _: &RuleThresholds,
) -> Result<Vec<Finding>, RuleError> {
    Ok(input
        .declarations("CSS_VIEWPORT_UNITS")?
        .iter()
        .filter(|decl| decl.uses_viewport_units())
        .map(|decl| {
            Finding::new(format!(
                "Viewport units in '{}: {}' are not supported by e-ink readers.",
                decl.property, decl.value
            ))
            .line(decl.line)
        })
        .collect())
}

fn detect_inline_styles(
    input: &RuleInput<'_>,
    thresholds: &RuleThresholds,
) -> Result<Vec<Finding>, RuleError> {
    let count = input.scan.map_or(0, |scan| scan.inline_style_count);
    if count <= thresholds.inline_style_limit {
        return Ok(Vec::new());
    }
    Ok(vec![Finding::new(format!(
        "{} inline style attributes (more than {}) slow down Kindle conversion.",
        count, thresholds.inline_style_limit
    ))
    .hint("Move repeated inline styles into a stylesheet class.")])
}

/// Evaluates a rule table against every content document and stylesheet.
#[derive(Debug)]
pub struct ContentRules {
    rules: Vec<ContentRule>,
}

impl Default for ContentRules {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl ContentRules {
    /// Engine over an explicit rule table.
    pub fn new(rules: Vec<ContentRule>) -> Self {
        Self { rules }
    }

    /// The rule table.
    pub fn rules(&self) -> &[ContentRule] {
        &self.rules
    }

    fn evaluate(&self, input: &RuleInput<'_>, ctx: &CheckContext<'_>) -> DocumentOutcome {
        let found = self
            .rules
            .iter()
            .filter(|rule| rule.applies_to(input.media_type))
            .filter(|rule| ctx.options.platforms.contains(rule.platform))
            .flat_map(|rule| rule.evaluate(input, &ctx.options.thresholds))
            .collect();
        DocumentOutcome::Checked(found)
    }
}

impl Check for ContentRules {
    fn name(&self) -> &'static str {
        "content-rules"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let documents = ctx.documents.documents();
        let stylesheets = ctx.documents.stylesheets();
        debug!(
            "[CHECK] {} rules over {} documents and {} stylesheets",
            self.rules.len(),
            documents.len(),
            stylesheets.len()
        );

        let mut outcomes = par_map(documents, |doc| {
            self.evaluate(&RuleInput::markup(&doc.path, &doc.scan), ctx)
        });
        outcomes.extend(par_map(stylesheets, |sheet| {
            self.evaluate(&RuleInput::stylesheet(&sheet.path, &sheet.text), ctx)
        }));
        outcomes
            .into_iter()
            .flat_map(DocumentOutcome::into_diagnostics)
            .collect()
    }
}

/// Package-level metadata rules, evaluated once per book.
pub struct MetadataRules;

impl Check for MetadataRules {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let Some(model) = ctx.model else {
            return Vec::new();
        };
        let opf = model.opf_path();
        let meta = model.metadata();
        let mut out = Vec::new();

        match meta.language.as_deref() {
            None => out.push(
                Diagnostic::error(
                    "METADATA_LANGUAGE_MISSING",
                    "Package metadata has no <dc:language> element.",
                )
                .at(opf)
                .spec("EPUB 3.3 § 5.5.3.2.3")
                .hint("Add <dc:language>en</dc:language> (or the book's language)."),
            ),
            Some(lang) if !BCP47_RE.is_match(lang.trim()) => out.push(
                Diagnostic::warning(
                    "METADATA_LANGUAGE_INVALID",
                    format!("Language '{}' is not a well-formed BCP 47 tag.", lang),
                )
                .at(opf)
                .spec("BCP 47 § 2.1"),
            ),
            Some(_) => {}
        }
        if meta.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
            out.push(
                Diagnostic::error("METADATA_TITLE_MISSING", "Package metadata has no <dc:title>.")
                    .at(opf)
                    .spec("EPUB 3.3 § 5.5.3.2.2"),
            );
        }
        if meta.identifier.as_deref().is_none_or(|i| i.trim().is_empty()) {
            out.push(
                Diagnostic::error(
                    "METADATA_IDENTIFIER_MISSING",
                    "Package metadata has no unique <dc:identifier>.",
                )
                .at(opf)
                .spec("EPUB 3.3 § 5.5.3.2.1"),
            );
        }

        if meta.is_fixed_layout() {
            for platform in [Platform::PcReader, Platform::Eink] {
                out.push(
                    Diagnostic::warning(
                        "FIXED_LAYOUT",
                        "Fixed-layout book (rendition:layout pre-paginated); reflow and font scaling are unavailable.",
                    )
                    .on(platform)
                    .at(opf),
                );
            }
        }

        for (prefix, platform) in [("ibooks:", Platform::AppleBooks), ("kobo:", Platform::Kobo)] {
            let vendor: Vec<&str> = meta
                .meta_properties
                .iter()
                .filter(|p| p.starts_with(prefix))
                .map(String::as_str)
                .collect();
            if !vendor.is_empty() {
                out.push(
                    Diagnostic::warning(
                        "VENDOR_METADATA",
                        format!(
                            "Vendor-specific metadata ({}) only affects {}.",
                            vendor.join(", "),
                            platform.display_name()
                        ),
                    )
                    .on(platform)
                    .at(opf),
                );
            }
        }

        out.push(
            Diagnostic::info(
                "KINDLE_CONVERSION",
                "Kindle does not read EPUB directly; the book is converted to KF8/AZW3 on delivery.",
            )
            .on(Platform::Kindle)
            .hint("Check the converted result in Kindle Previewer."),
        );
        out
    }
}
