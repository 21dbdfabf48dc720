//! Diagnostic values shared by every checking component.

use std::fmt;

/// Severity level for a diagnostic, ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational note; never affects the exit status.
    Info,
    /// Suspicious or non-ideal structure that may reduce compatibility.
    Warn,
    /// Violates a required structural expectation.
    Error,
    /// Prevents whole classes of checks from running or the book from opening.
    Critical,
}

impl Severity {
    /// All severities from most to least severe.
    pub const DESCENDING: [Severity; 4] = [
        Severity::Critical,
        Severity::Error,
        Severity::Warn,
        Severity::Info,
    ];

    /// Upper-case label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Returns `true` for severities that make a book fail validation.
    pub fn is_failure(self) -> bool {
        self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reading platform a diagnostic applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
    /// Desktop readers (Calibre, Adobe Digital Editions).
    PcReader,
    /// Apple Books, the strictest XML parser of the set.
    AppleBooks,
    /// Kobo readers.
    Kobo,
    /// E-ink readers with limited CSS (PocketBook, InkBook).
    Eink,
    /// Kindle, reached through MOBI/AZW3/KF8 conversion.
    Kindle,
    /// Android reader apps (Google Play Books, ReadEra, Moon+ Reader).
    Android,
    /// Affects every reader.
    General,
}

impl Platform {
    /// Every platform in report order.
    pub const ALL: [Platform; 7] = [
        Platform::PcReader,
        Platform::AppleBooks,
        Platform::Kobo,
        Platform::Eink,
        Platform::Kindle,
        Platform::Android,
        Platform::General,
    ];

    /// Stable machine tag.
    pub fn tag(self) -> &'static str {
        match self {
            Platform::PcReader => "pc_reader",
            Platform::AppleBooks => "apple_books",
            Platform::Kobo => "kobo",
            Platform::Eink => "eink",
            Platform::Kindle => "kindle",
            Platform::Android => "android",
            Platform::General => "general",
        }
    }

    /// Human-readable platform group name.
    pub fn display_name(self) -> &'static str {
        match self {
            Platform::PcReader => "PC readers (Calibre, Adobe Digital Editions)",
            Platform::AppleBooks => "Apple Books",
            Platform::Kobo => "Kobo",
            Platform::Eink => "E-ink readers (PocketBook, InkBook)",
            Platform::Kindle => "Kindle",
            Platform::Android => "Android readers",
            Platform::General => "General",
        }
    }

    /// Parse a machine tag. A few reader names are accepted as aliases.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        Some(match tag.as_str() {
            "pc_reader" | "pc" | "calibre" | "adobe" => Platform::PcReader,
            "apple_books" | "apple" | "ibooks" => Platform::AppleBooks,
            "kobo" => Platform::Kobo,
            "eink" | "e-ink" | "pocketbook" | "inkbook" => Platform::Eink,
            "kindle" => Platform::Kindle,
            "android" => Platform::Android,
            "general" => Platform::General,
            _ => return None,
        })
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Set of enabled platforms. `General` is always considered enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformSet(u8);

impl Default for PlatformSet {
    fn default() -> Self {
        Self::all()
    }
}

impl PlatformSet {
    /// Every platform.
    pub fn all() -> Self {
        Platform::ALL
            .iter()
            .fold(Self(0), |set, &p| set.with(p))
    }

    /// Only `General`.
    pub fn none() -> Self {
        Self(Platform::General.bit())
    }

    /// Add a platform.
    pub fn with(mut self, platform: Platform) -> Self {
        self.0 |= platform.bit();
        self
    }

    /// Returns `true` if diagnostics for `platform` should be reported.
    pub fn contains(self, platform: Platform) -> bool {
        platform == Platform::General || self.0 & platform.bit() != 0
    }
}

impl FromIterator<Platform> for PlatformSet {
    fn from_iter<I: IntoIterator<Item = Platform>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), |set, p| set.with(p))
    }
}

/// Where a diagnostic points.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    /// Archive path, if the finding belongs to one entry.
    pub path: Option<String>,
    /// 1-based line number within `path`.
    pub line: Option<usize>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, self.line) {
            (Some(path), Some(line)) => write!(f, "{}:{}", path, line),
            (Some(path), None) => f.write_str(path),
            (None, _) => f.write_str("(package)"),
        }
    }
}

/// One finding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Stable machine-readable diagnostic code.
    pub code: &'static str,
    /// Severity classification.
    pub severity: Severity,
    /// Platform this finding affects.
    pub platform: Platform,
    /// Source location.
    pub location: Location,
    /// Human-readable description.
    pub message: String,
    /// Optional EPUB spec reference label.
    pub spec_ref: Option<&'static str>,
    /// Optional remediation hint.
    pub hint: Option<String>,
}

impl Diagnostic {
    /// New diagnostic for the `General` platform.
    pub fn new(code: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            platform: Platform::General,
            location: Location::default(),
            message: message.into(),
            spec_ref: None,
            hint: None,
        }
    }

    /// New `Info` diagnostic.
    pub fn info(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Info, message)
    }

    /// New `Warn` diagnostic.
    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warn, message)
    }

    /// New `Error` diagnostic.
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    /// New `Critical` diagnostic.
    pub fn critical(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Critical, message)
    }

    /// Set the affected platform.
    pub fn on(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Point at an archive path.
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.location.path = Some(path.into());
        self
    }

    /// Point at a line within an archive path.
    pub fn at_line(mut self, path: impl Into<String>, line: usize) -> Self {
        self.location = Location {
            path: Some(path.into()),
            line: Some(line),
        };
        self
    }

    /// Attach a spec reference label.
    pub fn spec(mut self, spec_ref: &'static str) -> Self {
        self.spec_ref = Some(spec_ref);
        self
    }

    /// Attach a remediation hint.
    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} ({}): {}",
            self.severity, self.platform, self.code, self.location, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warn);
        assert!(Severity::Warn > Severity::Info);
        assert!(Severity::Error.is_failure());
        assert!(!Severity::Warn.is_failure());
    }

    #[test]
    fn test_platform_tags_round_trip() {
        for platform in Platform::ALL {
            assert_eq!(Platform::from_tag(platform.tag()), Some(platform));
        }
        assert_eq!(Platform::from_tag("PocketBook"), Some(Platform::Eink));
        assert_eq!(Platform::from_tag("nook"), None);
    }

    #[test]
    fn test_platform_set_always_includes_general() {
        let set: PlatformSet = [Platform::Kindle].into_iter().collect();
        assert!(set.contains(Platform::Kindle));
        assert!(set.contains(Platform::General));
        assert!(!set.contains(Platform::Eink));
        assert!(PlatformSet::default().contains(Platform::Eink));
    }

    #[test]
    fn test_builder_and_display() {
        let d = Diagnostic::error("LINK_BROKEN", "Broken link to 'chapter99.xhtml'")
            .at_line("OEBPS/ch1.xhtml", 12)
            .spec("EPUB 3.3 § 3.3.2");
        assert_eq!(d.platform, Platform::General);
        assert_eq!(
            d.to_string(),
            "[ERROR] general LINK_BROKEN (OEBPS/ch1.xhtml:12): Broken link to 'chapter99.xhtml'"
        );
    }
}
