//! Diagnostics aggregator
//!
//! Joins the outputs of every check into a [`Report`]: deduplicated,
//! filtered to the enabled platforms, bucketed by platform then severity,
//! with the rendering-breaking findings promoted into a separate view.

use std::collections::{BTreeMap, HashSet};

use crate::diagnostic::{Diagnostic, Location, Platform, PlatformSet, Severity};
use crate::metadata::PackageMetadata;

/// Findings that break rendering outright, with what the reader sees.
/// `None` matches any platform or any severity.
const RENDERING_BREAKING: &[(&str, Option<Platform>, Option<Severity>, &str)] = &[
    (
        "NAV_DOCUMENT_MISSING",
        None,
        None,
        "Readers show no table of contents and some refuse to open the book.",
    ),
    (
        "ARCHIVE_ENTRY_REFUSED",
        None,
        None,
        "A decompression-bomb entry was refused; the content it held is missing.",
    ),
    (
        "ARCHIVE_PATH_ESCAPE",
        None,
        None,
        "An entry points outside the archive; readers may reject the whole file.",
    ),
    (
        "OCF_MIMETYPE_MISSING",
        None,
        None,
        "Most readers do not recognise the file as an EPUB.",
    ),
    (
        "MIMETYPE_NOT_FIRST",
        None,
        None,
        "Most readers do not recognise the file as an EPUB.",
    ),
    (
        "OCF_MIMETYPE_COMPRESSED",
        None,
        None,
        "Most readers do not recognise the file as an EPUB.",
    ),
    (
        "SPINE_IDREF_NOT_IN_MANIFEST",
        None,
        None,
        "Chapters silently disappear from the reading order.",
    ),
    (
        "ENCRYPTION_PRESENT",
        None,
        None,
        "Devices without the matching DRM licence cannot open the book.",
    ),
    (
        "ENTITY_UNDECLARED",
        Some(Platform::AppleBooks),
        None,
        "Apple Books shows a parse error instead of the chapter.",
    ),
    (
        "XHTML_MALFORMED",
        Some(Platform::AppleBooks),
        None,
        "Apple Books stops rendering the chapter at the first XML error.",
    ),
    (
        "CSS_TRANSFORM",
        Some(Platform::Eink),
        None,
        "Transformed elements are drawn untransformed or not at all.",
    ),
    (
        "ARCHIVE_TOO_LARGE_KINDLE",
        Some(Platform::Kindle),
        None,
        "Send to Kindle rejects the file.",
    ),
    (
        "CSS_LARGE_MARGIN",
        Some(Platform::Eink),
        Some(Severity::Error),
        "Vertical margins this large leave little room for text on an e-ink page.",
    ),
];

const CRITICAL_CONSEQUENCE: &str = "Validation could not proceed past this point.";

fn consequence_for(diagnostic: &Diagnostic) -> Option<&'static str> {
    let listed = RENDERING_BREAKING
        .iter()
        .find(|(code, platform, severity, _)| {
            *code == diagnostic.code
                && platform.is_none_or(|p| p == diagnostic.platform)
                && severity.is_none_or(|s| s == diagnostic.severity)
        })
        .map(|&(_, _, _, consequence)| consequence);
    match listed {
        Some(consequence) => Some(consequence),
        None if diagnostic.severity == Severity::Critical => Some(CRITICAL_CONSEQUENCE),
        None => None,
    }
}

/// Process exit status derived from a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// No ERROR or CRITICAL findings
    Clean,
    /// The book was read and has ERROR or CRITICAL findings
    Violations,
    /// The input could not be opened as an archive
    Unreadable,
}

impl ExitStatus {
    /// Numeric process exit code.
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Violations => 1,
            ExitStatus::Unreadable => 2,
        }
    }
}

/// One promoted rule on one platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CriticalIssue {
    /// Diagnostic code
    pub code: &'static str,
    /// What the reader experiences
    pub consequence: &'static str,
    /// Occurrences of this code on this platform
    pub count: usize,
    /// First occurrence
    pub first: Diagnostic,
}

/// Promoted issues for one platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CriticalGroup {
    /// Platform
    pub platform: Platform,
    /// Issues in first-seen order
    pub issues: Vec<CriticalIssue>,
}

/// Summary counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    /// ERROR and CRITICAL findings
    pub issues: usize,
    /// WARN findings
    pub warnings: usize,
    /// INFO findings
    pub info: usize,
    /// Findings in the promoted critical view
    pub critical: usize,
}

/// Result of one validation run.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    metadata: Option<PackageMetadata>,
    diagnostics: Vec<Diagnostic>,
    buckets: BTreeMap<Platform, BTreeMap<Severity, Vec<usize>>>,
    critical: Vec<CriticalGroup>,
    counts: Counts,
    unreadable: bool,
}

impl Report {
    /// Aggregate diagnostics in join order.
    ///
    /// Identical (platform, message, location) triples are kept once and
    /// findings for disabled platforms are dropped; `general` findings
    /// always survive.
    pub fn aggregate<I>(
        diagnostics: I,
        metadata: Option<PackageMetadata>,
        platforms: PlatformSet,
    ) -> Self
    where
        I: IntoIterator<Item = Diagnostic>,
    {
        let mut seen: HashSet<(Platform, String, Location)> = HashSet::new();
        let kept: Vec<Diagnostic> = diagnostics
            .into_iter()
            .filter(|d| platforms.contains(d.platform))
            .filter(|d| seen.insert((d.platform, d.message.clone(), d.location.clone())))
            .collect();

        let mut buckets: BTreeMap<Platform, BTreeMap<Severity, Vec<usize>>> = BTreeMap::new();
        let mut counts = Counts::default();
        let mut critical: Vec<CriticalGroup> = Vec::new();

        for (index, d) in kept.iter().enumerate() {
            buckets
                .entry(d.platform)
                .or_default()
                .entry(d.severity)
                .or_default()
                .push(index);
            match d.severity {
                Severity::Critical | Severity::Error => counts.issues += 1,
                Severity::Warn => counts.warnings += 1,
                Severity::Info => counts.info += 1,
            }

            let Some(consequence) = consequence_for(d) else {
                continue;
            };
            counts.critical += 1;
            let group = match critical.iter().position(|g| g.platform == d.platform) {
                Some(i) => &mut critical[i],
                None => {
                    critical.push(CriticalGroup {
                        platform: d.platform,
                        issues: Vec::new(),
                    });
                    let last = critical.len() - 1;
                    &mut critical[last]
                }
            };
            match group.issues.iter_mut().find(|issue| issue.code == d.code) {
                Some(issue) => issue.count += 1,
                None => group.issues.push(CriticalIssue {
                    code: d.code,
                    consequence,
                    count: 1,
                    first: d.clone(),
                }),
            }
        }
        critical.sort_by_key(|g| g.platform);

        Self {
            metadata,
            diagnostics: kept,
            buckets,
            critical,
            counts,
            unreadable: false,
        }
    }

    /// Report for an input that could not be opened as an archive at all.
    pub fn unreadable(diagnostic: Diagnostic) -> Self {
        let mut report = Self::aggregate([diagnostic], None, PlatformSet::all());
        report.unreadable = true;
        report
    }

    /// Package metadata, when the package document could be parsed.
    pub fn metadata(&self) -> Option<&PackageMetadata> {
        self.metadata.as_ref()
    }

    /// Every kept diagnostic in join order.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Diagnostics for one platform and severity, in first-seen order.
    pub fn bucket(&self, platform: Platform, severity: Severity) -> Vec<&Diagnostic> {
        self.buckets
            .get(&platform)
            .and_then(|by_severity| by_severity.get(&severity))
            .map(|indices| indices.iter().map(|&i| &self.diagnostics[i]).collect())
            .unwrap_or_default()
    }

    /// Non-empty buckets: platforms in report order, severities from most
    /// to least severe.
    pub fn buckets(&self) -> Vec<(Platform, Severity, Vec<&Diagnostic>)> {
        let mut out = Vec::new();
        for (&platform, by_severity) in &self.buckets {
            for severity in Severity::DESCENDING {
                if let Some(indices) = by_severity.get(&severity) {
                    out.push((
                        platform,
                        severity,
                        indices.iter().map(|&i| &self.diagnostics[i]).collect(),
                    ));
                }
            }
        }
        out
    }

    /// The promoted "requires immediate attention" view, by platform.
    pub fn critical_view(&self) -> &[CriticalGroup] {
        &self.critical
    }

    /// Summary counts.
    pub fn counts(&self) -> Counts {
        self.counts
    }

    /// Returns `true` if any ERROR or CRITICAL finding was kept.
    pub fn has_failures(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity.is_failure())
    }

    /// Returns `true` if the input could not be opened.
    pub fn is_unreadable(&self) -> bool {
        self.unreadable
    }

    /// Exit status for command-line use.
    pub fn exit_status(&self) -> ExitStatus {
        if self.unreadable {
            ExitStatus::Unreadable
        } else if self.has_failures() {
            ExitStatus::Violations
        } else {
            ExitStatus::Clean
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Diagnostic> {
        vec![
            Diagnostic::warning("SCRIPT_EMBEDDED", "script").at("a.xhtml"),
            Diagnostic::error("CSS_TRANSFORM", "transform").on(Platform::Eink).at("s.css"),
            Diagnostic::error("LINK_BROKEN", "broken").at("a.xhtml"),
            Diagnostic::info("KINDLE_CONVERSION", "convert").on(Platform::Kindle),
            Diagnostic::error("CSS_TRANSFORM", "transform").on(Platform::Eink).at("s.css"),
            Diagnostic::error("CSS_TRANSFORM", "transform 2").on(Platform::Eink).at("s.css"),
        ]
    }

    #[test]
    fn test_buckets_and_dedup() {
        let report = Report::aggregate(sample(), None, PlatformSet::all());
        assert_eq!(report.diagnostics().len(), 5);
        let layout: Vec<(Platform, Severity, usize)> = report
            .buckets()
            .into_iter()
            .map(|(p, s, d)| (p, s, d.len()))
            .collect();
        assert_eq!(
            layout,
            vec![
                (Platform::Eink, Severity::Error, 2),
                (Platform::Kindle, Severity::Info, 1),
                (Platform::General, Severity::Error, 1),
                (Platform::General, Severity::Warn, 1),
            ]
        );
        assert_eq!(
            report.counts(),
            Counts {
                issues: 3,
                warnings: 1,
                info: 1,
                critical: 2
            }
        );
    }

    #[test]
    fn test_critical_view_groups_by_platform() {
        let report = Report::aggregate(sample(), None, PlatformSet::all());
        let view = report.critical_view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].platform, Platform::Eink);
        assert_eq!(view[0].issues.len(), 1);
        assert_eq!(view[0].issues[0].code, "CSS_TRANSFORM");
        assert_eq!(view[0].issues[0].count, 2);
    }

    #[test]
    fn test_platform_filter_keeps_general() {
        let platforms: PlatformSet = [Platform::Kindle].into_iter().collect();
        let report = Report::aggregate(sample(), None, platforms);
        assert!(report.bucket(Platform::Eink, Severity::Error).is_empty());
        assert_eq!(report.bucket(Platform::General, Severity::Error).len(), 1);
        assert_eq!(report.bucket(Platform::Kindle, Severity::Info).len(), 1);
        assert!(report.critical_view().is_empty());
    }

    #[test]
    fn test_large_margin_promoted_only_at_error() {
        let report = Report::aggregate(
            [
                Diagnostic::error("CSS_LARGE_MARGIN", "margin-top: 6em")
                    .on(Platform::Eink)
                    .at("a.css"),
                Diagnostic::warning("CSS_LARGE_MARGIN", "margin-bottom: 4em")
                    .on(Platform::Eink)
                    .at("b.css"),
            ],
            None,
            PlatformSet::all(),
        );
        let view = report.critical_view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].platform, Platform::Eink);
        assert_eq!(view[0].issues.len(), 1);
        assert_eq!(view[0].issues[0].code, "CSS_LARGE_MARGIN");
        assert_eq!(view[0].issues[0].count, 1);
        assert_eq!(view[0].issues[0].first.severity, Severity::Error);
    }

    #[test]
    fn test_critical_severity_is_promoted() {
        let report = Report::aggregate(
            [Diagnostic::critical("OPF_FILE_MISSING", "gone")],
            None,
            PlatformSet::all(),
        );
        assert_eq!(report.critical_view()[0].issues[0].consequence, CRITICAL_CONSEQUENCE);
        assert_eq!(report.exit_status(), ExitStatus::Violations);
    }

    #[test]
    fn test_exit_status() {
        let clean = Report::aggregate(
            [Diagnostic::warning("X", "only a warning")],
            None,
            PlatformSet::all(),
        );
        assert_eq!(clean.exit_status(), ExitStatus::Clean);
        assert_eq!(clean.exit_status().code(), 0);

        let unreadable = Report::unreadable(Diagnostic::critical("ZIP_INVALID_ARCHIVE", "nope"));
        assert_eq!(unreadable.exit_status(), ExitStatus::Unreadable);
        assert_eq!(unreadable.exit_status().code(), 2);
    }
}
