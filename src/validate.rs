//! EPUB validation entry points.
//!
//! A run opens the archive, builds the package model, pre-scans the content
//! documents and then runs an ordered list of [`Check`] values. Their
//! outputs are joined in list order and handed to [`Report::aggregate`].
//! Nothing here returns an error: failures become diagnostics, and an input
//! that is not an archive at all yields a single CRITICAL finding.

use std::io::Cursor;
use std::path::Path;
use std::time::Instant;

use log::{debug, warn};

use crate::archive::{Archive, ArchiveLimits, ReadSeek};
use crate::check::{par_map, Check, CheckContext, DocumentSet};
use crate::consistency::{
    IdentifierUniqueness, LinkResolution, NavigationPresence, PackageStructure, ReadingOrder,
};
use crate::diagnostic::{Diagnostic, PlatformSet};
use crate::error::{ArchiveError, ModelError};
use crate::ocf::ContainerRules;
use crate::package::{PackageModel, CONTAINER_PATH};
use crate::report::Report;
use crate::resources::ResourceRules;
use crate::rules::{ContentRules, MetadataRules, RuleThresholds};

/// Options for validation runs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ValidationOptions {
    /// Archive safety limits
    pub limits: ArchiveLimits,
    /// Empirical rule thresholds
    pub thresholds: RuleThresholds,
    /// Platforms to report on; `general` is always reported
    pub platforms: PlatformSet,
}

impl ValidationOptions {
    /// Replace the archive limits.
    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Replace the rule thresholds.
    pub fn with_thresholds(mut self, thresholds: RuleThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Restrict reporting to these platforms.
    pub fn with_platforms(mut self, platforms: PlatformSet) -> Self {
        self.platforms = platforms;
        self
    }

    /// Set the maximum expansion ratio.
    pub fn with_max_ratio(mut self, max_ratio: u64) -> Self {
        self.limits = self.limits.with_max_ratio(max_ratio);
        self
    }

    /// Set the absolute uncompressed size ceiling.
    pub fn with_max_entry_size(mut self, max_entry_size: u64) -> Self {
        self.limits = self.limits.with_max_entry_size(max_entry_size);
        self
    }
}

/// The built-in checks in join order.
pub fn default_checks() -> Vec<Box<dyn Check>> {
    vec![
        Box::new(ContainerRules),
        Box::new(PackageStructure),
        Box::new(NavigationPresence),
        Box::new(IdentifierUniqueness),
        Box::new(LinkResolution),
        Box::new(ReadingOrder),
        Box::new(MetadataRules),
        Box::new(ResourceRules),
        Box::new(ContentRules::default()),
    ]
}

/// A configured validation engine.
pub struct Validator {
    options: ValidationOptions,
    checks: Vec<Box<dyn Check>>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationOptions::default())
    }
}

impl Validator {
    /// Engine with the built-in checks.
    pub fn new(options: ValidationOptions) -> Self {
        Self::with_checks(options, default_checks())
    }

    /// Engine with an explicit check list.
    pub fn with_checks(options: ValidationOptions, checks: Vec<Box<dyn Check>>) -> Self {
        Self { options, checks }
    }

    /// Options this engine runs with.
    pub fn options(&self) -> &ValidationOptions {
        &self.options
    }

    /// Names of the configured checks, in join order.
    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|check| check.name()).collect()
    }

    /// Validate an already opened archive.
    pub fn validate_archive(&self, archive: &Archive) -> Report {
        let (model, model_failure) = match PackageModel::build(archive) {
            Ok(model) => (Some(model), None),
            Err(err) => {
                warn!("[PACKAGE] model not built: {}", err);
                (None, Some(model_error_diagnostic(&err)))
            }
        };
        let documents = DocumentSet::load(archive, model.as_ref());
        let ctx = CheckContext {
            archive,
            model: model.as_ref(),
            documents: &documents,
            options: &self.options,
        };

        let results = par_map(&self.checks, |check| {
            let started = Instant::now();
            let found = check.run(&ctx);
            debug!(
                "[CHECK] {}: {} findings in {:?}",
                check.name(),
                found.len(),
                started.elapsed()
            );
            found
        });

        Report::aggregate(
            model_failure.into_iter().chain(results.into_iter().flatten()),
            model.map(|m| m.metadata().clone()),
            self.options.platforms,
        )
    }

    /// Validate from a filesystem path.
    pub fn validate_file<P: AsRef<Path>>(&self, path: P) -> Report {
        match Archive::open_with_limits(path, self.options.limits) {
            Ok(archive) => self.validate_archive(&archive),
            Err(err) => unreadable_report(err),
        }
    }

    /// Validate from any seekable reader.
    pub fn validate_reader<R: ReadSeek + 'static>(&self, reader: R) -> Report {
        match Archive::from_reader(reader, self.options.limits) {
            Ok(archive) => self.validate_archive(&archive),
            Err(err) => unreadable_report(err),
        }
    }

    /// Validate archive bytes held in memory.
    pub fn validate_bytes(&self, bytes: Vec<u8>) -> Report {
        self.validate_reader(Cursor::new(bytes))
    }
}

pub(crate) fn unreadable_report(err: ArchiveError) -> Report {
    warn!("[ARCHIVE] cannot open: {}", err);
    Report::unreadable(
        Diagnostic::critical(
            "ZIP_INVALID_ARCHIVE",
            format!("Could not open the file as an EPUB archive: {}", err),
        )
        .spec("EPUB OCF 3.0 § 4.1")
        .hint("EPUB files are ZIP archives; re-export the book from its authoring tool."),
    )
}

fn model_error_diagnostic(err: &ModelError) -> Diagnostic {
    let diagnostic = match err {
        ModelError::MissingContainerPointer(detail) => Diagnostic::critical(
            "OCF_CONTAINER_XML_MISSING",
            format!("Cannot locate the package document: {}", detail),
        )
        .at(CONTAINER_PATH)
        .spec("EPUB OCF 3.0 § 3.5.1"),
        ModelError::MissingPackageDocument(path) => Diagnostic::critical(
            "OPF_FILE_MISSING",
            format!("Package document '{}' referenced by container.xml is missing.", path),
        )
        .at(CONTAINER_PATH)
        .spec("EPUB OCF 3.0 § 3.5.1"),
        ModelError::MalformedXml { path, message } => Diagnostic::critical(
            if path == CONTAINER_PATH {
                "OCF_CONTAINER_XML_PARSE_ERROR"
            } else {
                "OPF_PARSE_ERROR"
            },
            format!("Could not parse '{}': {}", path, message),
        )
        .at(path),
        ModelError::Archive(inner) => Diagnostic::critical(
            "OPF_UNREADABLE",
            format!("Could not read the package document: {}", inner),
        ),
    };
    diagnostic.hint("Checks that need the package model were skipped.")
}

/// Validate an EPUB from a filesystem path.
pub fn validate_epub_file<P: AsRef<Path>>(path: P) -> Report {
    validate_epub_file_with_options(path, ValidationOptions::default())
}

/// Validate an EPUB from a filesystem path with explicit options.
pub fn validate_epub_file_with_options<P: AsRef<Path>>(
    path: P,
    options: ValidationOptions,
) -> Report {
    Validator::new(options).validate_file(path)
}

/// Validate an EPUB from any seekable reader.
pub fn validate_epub_reader<R: ReadSeek + 'static>(reader: R) -> Report {
    validate_epub_reader_with_options(reader, ValidationOptions::default())
}

/// Validate an EPUB from any seekable reader with explicit options.
pub fn validate_epub_reader_with_options<R: ReadSeek + 'static>(
    reader: R,
    options: ValidationOptions,
) -> Report {
    Validator::new(options).validate_reader(reader)
}

/// Validate EPUB bytes held in memory.
pub fn validate_epub_bytes(bytes: Vec<u8>, options: ValidationOptions) -> Report {
    Validator::new(options).validate_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{Platform, Severity};
    use crate::report::ExitStatus;
    use crate::test_support::{clean_book, opf, xhtml, ZipBuilder};

    fn codes(report: &Report) -> Vec<&'static str> {
        report.diagnostics().iter().map(|d| d.code).collect()
    }

    #[test]
    fn test_clean_book_passes() {
        let report = validate_epub_bytes(clean_book().build(), ValidationOptions::default());
        assert_eq!(codes(&report), vec!["KINDLE_CONVERSION"]);
        assert_eq!(report.exit_status(), ExitStatus::Clean);
        assert_eq!(
            report.metadata().and_then(|m| m.title.as_deref()),
            Some("Test Book")
        );
    }

    #[test]
    fn test_not_an_archive() {
        let report = validate_epub_bytes(b"plain text".to_vec(), ValidationOptions::default());
        assert_eq!(codes(&report), vec!["ZIP_INVALID_ARCHIVE"]);
        assert_eq!(report.diagnostics()[0].severity, Severity::Critical);
        assert_eq!(report.exit_status(), ExitStatus::Unreadable);
    }

    #[test]
    fn test_missing_container_still_runs_raw_checks() {
        let bytes = ZipBuilder::new()
            .stored("mimetype", b"application/epub+zip")
            .deflated("OEBPS/ch1.xhtml", xhtml("<p>&nbsp;</p>").as_bytes())
            .build();
        let report = validate_epub_bytes(bytes, ValidationOptions::default());
        assert_eq!(codes(&report), vec!["OCF_CONTAINER_XML_MISSING", "ENTITY_UNDECLARED"]);
        assert_eq!(report.exit_status(), ExitStatus::Violations);
        assert!(report.metadata().is_none());
    }

    #[test]
    fn test_malformed_opf_is_critical() {
        let bytes = ZipBuilder::epub("<package><metadata></package>").build();
        let report = validate_epub_bytes(bytes, ValidationOptions::default());
        assert_eq!(report.diagnostics()[0].code, "OPF_PARSE_ERROR");
        assert_eq!(report.diagnostics()[0].severity, Severity::Critical);
        assert_eq!(report.critical_view().len(), 1);
    }

    #[test]
    fn test_platform_filter() {
        let manifest = r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="cv" href="cv.png" media-type="image/png" properties="cover-image"/>"#;
        let bytes = ZipBuilder::epub(&opf("3.0", manifest, r#"<itemref idref="c1"/>"#))
            .deflated(
                "OEBPS/nav.xhtml",
                crate::test_support::nav_doc(&["ch1.xhtml"]).as_bytes(),
            )
            .deflated(
                "OEBPS/ch1.xhtml",
                xhtml(r#"<p style="transform: rotate(2deg)">x</p>"#).as_bytes(),
            )
            .stored("OEBPS/cv.png", &crate::test_support::png_header(600, 800))
            .build();

        let all = validate_epub_bytes(bytes.clone(), ValidationOptions::default());
        assert!(all.diagnostics().iter().any(|d| d.platform == Platform::Eink));

        let kindle_only = ValidationOptions::default()
            .with_platforms([Platform::Kindle].into_iter().collect());
        let filtered = validate_epub_bytes(bytes, kindle_only);
        assert!(filtered
            .diagnostics()
            .iter()
            .all(|d| matches!(d.platform, Platform::Kindle | Platform::General)));
    }

    #[test]
    fn test_custom_check_list() {
        let validator =
            Validator::with_checks(ValidationOptions::default(), vec![Box::new(ContainerRules)]);
        assert_eq!(validator.check_names(), vec!["container"]);
        let report = validator.validate_bytes(clean_book().build());
        assert!(report.diagnostics().is_empty());
    }
}
