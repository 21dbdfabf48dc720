//! Check plumbing shared by the consistency and content engines.
//!
//! Every check is a value implementing [`Check`]; the validator holds an
//! ordered list of them and joins their outputs in that order. Content
//! documents are read and scanned once up front into a [`DocumentSet`] so
//! the checks only borrow.

use log::warn;

use crate::archive::Archive;
use crate::diagnostic::Diagnostic;
use crate::markup::MarkupScan;
use crate::package::PackageModel;
use crate::validate::ValidationOptions;

/// Everything a check may look at. All borrows are immutable.
pub struct CheckContext<'a> {
    /// The opened archive and its content cache
    pub archive: &'a Archive,
    /// Package model, absent when it could not be built
    pub model: Option<&'a PackageModel>,
    /// Pre-scanned content documents and stylesheets
    pub documents: &'a DocumentSet,
    /// Run configuration
    pub options: &'a ValidationOptions,
}

/// One independent validation pass over the archive and model.
pub trait Check: Send + Sync {
    /// Short stable name, used in logs.
    fn name(&self) -> &'static str;

    /// Run the check. Checks that need the model return nothing when it is
    /// absent.
    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic>;
}

/// A decoded, scanned XHTML document.
#[derive(Debug)]
pub struct ContentDocument {
    /// Archive path
    pub path: String,
    /// Decoded text (lossy UTF-8, BOM stripped)
    pub text: String,
    /// Tag-level scan of `text`
    pub scan: MarkupScan,
}

/// A decoded stylesheet.
#[derive(Debug)]
pub struct StylesheetDocument {
    /// Archive path
    pub path: String,
    /// Decoded text
    pub text: String,
}

/// Result of processing one document: its findings, or the single
/// diagnostic explaining why it could not be processed.
#[derive(Debug)]
pub enum DocumentOutcome {
    /// Processed; zero or more findings
    Checked(Vec<Diagnostic>),
    /// Could not be processed at all
    Failed(Diagnostic),
}

impl DocumentOutcome {
    /// Flatten into diagnostics.
    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        match self {
            DocumentOutcome::Checked(found) => found,
            DocumentOutcome::Failed(diagnostic) => vec![diagnostic],
        }
    }
}

/// Content documents and stylesheets of one run.
#[derive(Debug, Default)]
pub struct DocumentSet {
    documents: Vec<ContentDocument>,
    stylesheets: Vec<StylesheetDocument>,
    failures: Vec<Diagnostic>,
}

impl DocumentSet {
    /// Read and scan the documents the model declares. Without a model the
    /// archive is searched by file extension so raw-content rules still run.
    pub fn load(archive: &Archive, model: Option<&PackageModel>) -> Self {
        let (markup, styles) = match model {
            Some(model) => (
                model
                    .content_documents()
                    .map(|item| item.href.clone())
                    .collect::<Vec<_>>(),
                model
                    .manifest()
                    .iter()
                    .filter(|item| item.media_type == "text/css" && !item.href.is_empty())
                    .map(|item| item.href.clone())
                    .collect::<Vec<_>>(),
            ),
            None => {
                let by_ext = |exts: &[&str]| {
                    archive
                        .list_entries()
                        .iter()
                        .filter(|e| has_extension(&e.path, exts))
                        .map(|e| e.path.clone())
                        .collect::<Vec<_>>()
                };
                (by_ext(&["xhtml", "html", "htm"]), by_ext(&["css"]))
            }
        };

        let mut set = DocumentSet::default();
        let loaded: Vec<Result<Option<ContentDocument>, Diagnostic>> = par_map(&markup, |path| {
            read_document(archive, path).map(|text| {
                text.map(|text| ContentDocument {
                    path: path.clone(),
                    scan: MarkupScan::scan(&text),
                    text,
                })
            })
        });
        for result in loaded {
            match result {
                Ok(Some(doc)) => set.documents.push(doc),
                Ok(None) => {}
                Err(diagnostic) => set.failures.push(diagnostic),
            }
        }
        for path in &styles {
            match read_document(archive, path) {
                Ok(Some(text)) => set.stylesheets.push(StylesheetDocument {
                    path: path.clone(),
                    text,
                }),
                Ok(None) => {}
                Err(diagnostic) => set.failures.push(diagnostic),
            }
        }
        set
    }

    /// Scanned content documents in manifest order.
    pub fn documents(&self) -> &[ContentDocument] {
        &self.documents
    }

    /// Content document by archive path.
    pub fn document(&self, path: &str) -> Option<&ContentDocument> {
        self.documents.iter().find(|doc| doc.path == path)
    }

    /// Stylesheets in manifest order.
    pub fn stylesheets(&self) -> &[StylesheetDocument] {
        &self.stylesheets
    }

    /// Documents that exist but could not be read.
    pub fn failures(&self) -> &[Diagnostic] {
        &self.failures
    }
}

/// Read one document. Missing and size-refused entries yield `Ok(None)`:
/// those are reported once by the manifest and archive checks.
fn read_document(archive: &Archive, path: &str) -> Result<Option<String>, Diagnostic> {
    if !archive.contains(path) || archive.is_refused(path) {
        return Ok(None);
    }
    archive.read_text(path).map(Some).map_err(|err| {
        warn!("[CHECK] could not read '{}': {}", path, err);
        Diagnostic::error("DOCUMENT_UNREADABLE", format!("Failed to read '{}': {}", path, err))
            .at(path)
    })
}

fn has_extension(path: &str, exts: &[&str]) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| exts.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Map over a slice, on the rayon pool when the `parallel` feature is on.
/// Output order always matches input order.
#[cfg(feature = "parallel")]
pub(crate) fn par_map<I, T, F>(items: &[I], f: F) -> Vec<T>
where
    I: Sync,
    T: Send,
    F: Fn(&I) -> T + Send + Sync,
{
    use rayon::prelude::*;
    items.par_iter().map(f).collect()
}

/// Map over a slice, on the rayon pool when the `parallel` feature is on.
/// Output order always matches input order.
#[cfg(not(feature = "parallel"))]
pub(crate) fn par_map<I, T, F>(items: &[I], f: F) -> Vec<T>
where
    I: Sync,
    T: Send,
    F: Fn(&I) -> T + Send + Sync,
{
    items.iter().map(f).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveLimits;
    use crate::test_support::{clean_book, xhtml, ZipBuilder};

    #[test]
    fn test_load_from_model() {
        let archive = Archive::from_bytes(clean_book().build(), ArchiveLimits::default()).unwrap();
        let model = PackageModel::build(&archive).unwrap();
        let set = DocumentSet::load(&archive, Some(&model));
        let paths: Vec<&str> = set.documents().iter().map(|d| d.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["OEBPS/nav.xhtml", "OEBPS/text/ch1.xhtml", "OEBPS/text/ch2.xhtml"]
        );
        assert_eq!(set.stylesheets().len(), 1);
        assert!(set.failures().is_empty());
        let ch1 = set.document("OEBPS/text/ch1.xhtml").unwrap();
        assert_eq!(ch1.scan.ids[0].0, "top");
    }

    #[test]
    fn test_load_without_model_uses_extensions() {
        let archive = Archive::from_bytes(
            ZipBuilder::new()
                .stored("mimetype", b"application/epub+zip")
                .deflated("OEBPS/a.xhtml", xhtml("<p>a</p>").as_bytes())
                .deflated("OEBPS/b.HTML", xhtml("<p>b</p>").as_bytes())
                .deflated("OEBPS/s.css", b"p{}")
                .build(),
            ArchiveLimits::default(),
        )
        .unwrap();
        let set = DocumentSet::load(&archive, None);
        assert_eq!(set.documents().len(), 2);
        assert_eq!(set.stylesheets().len(), 1);
    }

    #[test]
    fn test_corrupt_document_is_isolated() {
        let archive = Archive::from_bytes(
            ZipBuilder::new()
                .stored("mimetype", b"application/epub+zip")
                .deflated("OEBPS/good.xhtml", xhtml("<p>a</p>").as_bytes())
                .deflated("OEBPS/bad.xhtml", xhtml("<p>b</p>").as_bytes())
                .with_crc(0xDEAD_BEEF)
                .build(),
            ArchiveLimits::default(),
        )
        .unwrap();
        let set = DocumentSet::load(&archive, None);
        assert_eq!(set.documents().len(), 1);
        assert_eq!(set.failures().len(), 1);
        assert_eq!(set.failures()[0].code, "DOCUMENT_UNREADABLE");
        assert_eq!(
            set.failures()[0].location.path.as_deref(),
            Some("OEBPS/bad.xhtml")
        );
    }

    #[test]
    fn test_outcome_flattening() {
        let failed = DocumentOutcome::Failed(Diagnostic::warning("X", "y"));
        assert_eq!(failed.into_diagnostics().len(), 1);
        assert!(DocumentOutcome::Checked(Vec::new()).into_diagnostics().is_empty());
    }
}
