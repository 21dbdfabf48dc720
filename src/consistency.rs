//! Navigation and consistency engine
//!
//! Cross-document agreement: manifest, spine and navigation must describe
//! the same book, element ids must be addressable, and every internal link
//! must land somewhere.

use std::collections::BTreeMap;

use crate::check::{Check, CheckContext, DocumentSet};
use crate::diagnostic::Diagnostic;
use crate::markup::LinkKind;
use crate::navigation::{NavSection, NavigationModel};
use crate::package::Generation;
use crate::path::{is_external, resolve_relative, split_fragment};

const SPEC_NAV: &str = "EPUB 3.3 § 5.4";
const SPEC_NCX: &str = "EPUB 2.0.1 § 2.4.1";
const SPEC_IDS: &str = "XML 1.0 § 3.3.1";
const SPEC_LINKS: &str = "EPUB 3.3 § 3.3.2";

/// Element ids of every content document, by document path.
///
/// Only the first occurrence of an id within a document is indexed; later
/// ones are kept in `duplicates`.
#[derive(Clone, Debug, Default)]
pub struct IdentifierIndex {
    by_document: BTreeMap<String, BTreeMap<String, usize>>,
    duplicates: Vec<DuplicateId>,
}

/// An id repeated within one document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateId {
    /// Document path
    pub path: String,
    /// The repeated id
    pub id: String,
    /// Line of the first occurrence
    pub first_line: usize,
    /// Line of the first repeat
    pub line: usize,
}

impl IdentifierIndex {
    /// Index all scanned documents.
    pub fn build(documents: &DocumentSet) -> Self {
        let mut index = IdentifierIndex::default();
        for doc in documents.documents() {
            let ids = index.by_document.entry(doc.path.clone()).or_default();
            for (id, line) in &doc.scan.ids {
                match ids.get(id) {
                    None => {
                        ids.insert(id.clone(), *line);
                    }
                    Some(&first_line) => {
                        if !index
                            .duplicates
                            .iter()
                            .any(|d| d.path == doc.path && &d.id == id)
                        {
                            index.duplicates.push(DuplicateId {
                                path: doc.path.clone(),
                                id: id.clone(),
                                first_line,
                                line: *line,
                            });
                        }
                    }
                }
            }
        }
        index
    }

    /// Returns `true` if the document was indexed.
    pub fn has_document(&self, path: &str) -> bool {
        self.by_document.contains_key(path)
    }

    /// Returns `true` if `id` exists in the document at `path`.
    pub fn contains(&self, path: &str, id: &str) -> bool {
        self.by_document
            .get(path)
            .is_some_and(|ids| ids.contains_key(id))
    }

    /// Line of `id` in `path`.
    pub fn line_of(&self, path: &str, id: &str) -> Option<usize> {
        self.by_document.get(path)?.get(id).copied()
    }

    /// Ids repeated within a single document, one entry per (document, id).
    pub fn duplicates(&self) -> &[DuplicateId] {
        &self.duplicates
    }

    /// Ids used in more than one document, with the documents in path
    /// order.
    pub fn cross_document(&self) -> Vec<(&str, Vec<&str>)> {
        let mut users: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (path, ids) in &self.by_document {
            for id in ids.keys() {
                users.entry(id.as_str()).or_default().push(path.as_str());
            }
        }
        users.into_iter().filter(|(_, paths)| paths.len() > 1).collect()
    }
}

/// Structural findings recorded while the package model was built.
pub struct PackageStructure;

impl Check for PackageStructure {
    fn name(&self) -> &'static str {
        "package-structure"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let mut out: Vec<Diagnostic> = ctx
            .model
            .map(|model| model.diagnostics().to_vec())
            .unwrap_or_default();
        out.extend(ctx.documents.failures().iter().cloned());
        out
    }
}

/// The navigation file required by the package generation is present and
/// its entries resolve.
pub struct NavigationPresence;

impl NavigationPresence {
    fn modern(ctx: &CheckContext<'_>, out: &mut Vec<Diagnostic>) {
        let Some(model) = ctx.model else { return };
        let nav_items: Vec<_> = model.nav_items().collect();
        match nav_items.as_slice() {
            [] => {
                let mut d = Diagnostic::error(
                    "NAV_DOCUMENT_MISSING",
                    "Missing navigation document with properties='nav' (required in EPUB 3).",
                )
                .at(model.opf_path())
                .spec(SPEC_NAV);
                d = match model.ncx_item() {
                    Some(ncx) => d.hint(format!(
                        "Only the EPUB 2 NCX '{}' is present; add an XHTML nav document.",
                        ncx.href
                    )),
                    None => d.hint("Add a manifest item with properties=\"nav\"."),
                };
                out.push(d);
            }
            [nav, rest @ ..] => {
                if !rest.is_empty() {
                    out.push(
                        Diagnostic::error(
                            "NAV_DOCUMENT_MULTIPLE",
                            format!(
                                "Multiple navigation documents declared ({}) - only one allowed.",
                                nav_items.len()
                            ),
                        )
                        .at(model.opf_path())
                        .spec(SPEC_NAV),
                    );
                }
                if nav.media_type != "application/xhtml+xml" {
                    out.push(
                        Diagnostic::error(
                            "NAV_DOCUMENT_MEDIA_TYPE_INVALID",
                            format!(
                                "Navigation item '{}' has unexpected media-type '{}'.",
                                nav.id, nav.media_type
                            ),
                        )
                        .at(model.opf_path()),
                    );
                }
                if nav.href.is_empty() || !ctx.archive.contains(&nav.href) {
                    out.push(
                        Diagnostic::error(
                            "NAV_DOCUMENT_MISSING",
                            format!(
                                "Manifest nav item points to missing file '{}'.",
                                nav.raw_href
                            ),
                        )
                        .at(model.opf_path())
                        .spec(SPEC_NAV),
                    );
                }
            }
        }
    }

    fn legacy(ctx: &CheckContext<'_>, out: &mut Vec<Diagnostic>) {
        let Some(model) = ctx.model else { return };
        match model.spine().toc_id() {
            Some(toc_id) => match model.item(toc_id) {
                None => out.push(
                    Diagnostic::error(
                        "NCX_IDREF_NOT_IN_MANIFEST",
                        format!("Spine `toc` references unknown manifest id '{}'.", toc_id),
                    )
                    .at(model.opf_path())
                    .spec(SPEC_NCX),
                ),
                Some(item) if item.href.is_empty() || !ctx.archive.contains(&item.href) => out
                    .push(
                        Diagnostic::error(
                            "NCX_MISSING",
                            format!(
                                "Spine `toc` references '{}' but resolved path '{}' is missing.",
                                toc_id, item.href
                            ),
                        )
                        .at(model.opf_path())
                        .spec(SPEC_NCX),
                    ),
                Some(_) => {}
            },
            None => {
                let d = match (model.ncx_item(), model.nav_items().next()) {
                    (Some(ncx), _) => Diagnostic::error(
                        "SPINE_TOC_MISSING",
                        format!("NCX '{}' is not referenced from the spine `toc` attribute.", ncx.id),
                    )
                    .hint(format!("Add toc=\"{}\" to the <spine> element.", ncx.id)),
                    (None, Some(nav)) => Diagnostic::warning(
                        "NCX_MISSING",
                        format!(
                            "EPUB 2 package has only the EPUB 3 nav document '{}'; older readers need toc.ncx.",
                            nav.href
                        ),
                    ),
                    (None, None) => Diagnostic::error(
                        "NCX_MISSING",
                        "Missing toc.ncx file (required in EPUB 2.0).",
                    ),
                };
                out.push(d.at(model.opf_path()).spec(SPEC_NCX));
            }
        }
    }

    fn entries(ctx: &CheckContext<'_>, ids: &IdentifierIndex, out: &mut Vec<Diagnostic>) {
        let Some(nav) = ctx.model.and_then(|m| m.navigation()) else {
            return;
        };
        let source = nav.path();
        if !nav.navigation().has_toc() {
            out.push(
                Diagnostic::warning("NAV_TOC_EMPTY", "Navigation has no table of contents entries.")
                    .at(source),
            );
        }
        for entry in nav.entries() {
            if entry.section == NavSection::Toc && entry.label.trim().is_empty() {
                out.push(
                    Diagnostic::warning(
                        "NAV_LABEL_EMPTY",
                        format!("Navigation entry for '{}' has no label.", entry.href),
                    )
                    .at(source),
                );
            }
            if is_external(&entry.href) {
                continue;
            }
            let Some(target) = entry.target.as_deref() else {
                out.push(
                    Diagnostic::error(
                        "NAV_TARGET_UNRESOLVED",
                        format!("Navigation entry '{}' resolves outside the archive.", entry.href),
                    )
                    .at(source),
                );
                continue;
            };
            if !ctx.archive.contains(target) {
                out.push(
                    Diagnostic::error(
                        "NAV_TARGET_MISSING",
                        format!(
                            "Navigation entry '{}' points to missing file '{}'.",
                            entry.href, target
                        ),
                    )
                    .at(source)
                    .spec(SPEC_NAV),
                );
                continue;
            }
            if let Some(fragment) = entry.fragment.as_deref() {
                if ids.has_document(target) && !ids.contains(target, fragment) {
                    out.push(
                        Diagnostic::error(
                            "NAV_FRAGMENT_MISSING",
                            format!(
                                "Navigation entry '{}' - fragment ID '{}' not found in target.",
                                entry.href, fragment
                            ),
                        )
                        .at(source)
                        .spec(SPEC_LINKS),
                    );
                }
            }
        }
    }
}

impl Check for NavigationPresence {
    fn name(&self) -> &'static str {
        "navigation"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let Some(model) = ctx.model else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match model.generation() {
            Generation::Modern => Self::modern(ctx, &mut out),
            Generation::Legacy => Self::legacy(ctx, &mut out),
        }
        let ids = IdentifierIndex::build(ctx.documents);
        Self::entries(ctx, &ids, &mut out);
        out
    }
}

/// Element ids are unique within each document; repeats across documents
/// are tracked separately because some readers mishandle them.
pub struct IdentifierUniqueness;

impl Check for IdentifierUniqueness {
    fn name(&self) -> &'static str {
        "identifiers"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let index = IdentifierIndex::build(ctx.documents);
        let mut out: Vec<Diagnostic> = index
            .duplicates()
            .iter()
            .map(|dup| {
                Diagnostic::error(
                    "ID_DUPLICATE",
                    format!(
                        "Duplicate ID '{}' in '{}' (first defined on line {}).",
                        dup.id, dup.path, dup.first_line
                    ),
                )
                .at_line(&dup.path, dup.line)
                .spec(SPEC_IDS)
                .hint("Fragment links can only reach the first element with a given id.")
            })
            .collect();

        for (id, paths) in index.cross_document() {
            let shown: Vec<&str> = paths.iter().take(3).copied().collect();
            out.push(
                Diagnostic::warning(
                    "ID_DUPLICATE_CROSS_DOCUMENT",
                    format!(
                        "Duplicate ID '{}' found in multiple files: {}{}",
                        id,
                        shown.join(", "),
                        if paths.len() > 3 { ", ..." } else { "" }
                    ),
                )
                .at(paths[0])
                .spec(SPEC_IDS),
            );
        }
        out
    }
}

/// Every internal link and resource reference resolves to an archive
/// entry, and fragment links land on an existing id.
///
/// Hyperlinks inside the parsed navigation document are left to
/// [`NavigationPresence`], which reports them as navigation entries.
pub struct LinkResolution;

impl Check for LinkResolution {
    fn name(&self) -> &'static str {
        "links"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let ids = IdentifierIndex::build(ctx.documents);
        let nav_document = match ctx.model.and_then(|m| m.navigation()) {
            Some(NavigationModel::NavDocument { path, .. }) => Some(path.as_str()),
            _ => None,
        };
        let mut out = Vec::new();
        for doc in ctx.documents.documents() {
            let in_nav = nav_document == Some(doc.path.as_str());
            for link in &doc.scan.links {
                if is_external(&link.href) || (in_nav && link.kind == LinkKind::Hyperlink) {
                    continue;
                }
                let (file_part, fragment) = split_fragment(&link.href);
                let fragment = fragment.filter(|f| !f.is_empty());
                let target = if file_part.is_empty() {
                    Some(doc.path.clone())
                } else {
                    resolve_relative(&doc.path, &link.href)
                };
                let Some(target) = target else {
                    out.push(
                        Diagnostic::error(
                            "LINK_ESCAPES_ARCHIVE",
                            format!("Link to '{}' resolves outside the archive.", link.href),
                        )
                        .at_line(&doc.path, link.line)
                        .spec(SPEC_LINKS),
                    );
                    continue;
                };

                if !ctx.archive.contains(&target) {
                    let (code, what) = match link.kind {
                        LinkKind::Hyperlink => ("LINK_BROKEN", "Broken link to"),
                        LinkKind::Resource => ("RESOURCE_MISSING", "Reference to missing resource"),
                    };
                    let mut d = Diagnostic::error(
                        code,
                        format!("{} '{}' (file not found).", what, link.href),
                    )
                    .at_line(&doc.path, link.line)
                    .spec(SPEC_LINKS);
                    if let Some(found) = ctx.archive.find_case_insensitive(&target) {
                        d = d.hint(format!("Archive contains '{}' with different case.", found));
                    }
                    out.push(d);
                    continue;
                }

                if let Some(model) = ctx.model {
                    if target != model.opf_path() && model.item_by_path(&target).is_none() {
                        out.push(
                            Diagnostic::warning(
                                "LINK_TARGET_NOT_IN_MANIFEST",
                                format!("Link target '{}' is not declared in the manifest.", target),
                            )
                            .at_line(&doc.path, link.line),
                        );
                    }
                }

                if let (LinkKind::Hyperlink, Some(fragment)) = (link.kind, fragment) {
                    if ids.has_document(&target) && !ids.contains(&target, fragment) {
                        out.push(
                            Diagnostic::error(
                                "LINK_FRAGMENT_MISSING",
                                format!(
                                    "Link to '{}' - fragment ID '{}' not found in target.",
                                    link.href, fragment
                                ),
                            )
                            .at_line(&doc.path, link.line)
                            .spec(SPEC_LINKS),
                        );
                    }
                }
            }
        }
        out
    }
}

/// Content documents the spine never reaches.
pub struct ReadingOrder;

impl Check for ReadingOrder {
    fn name(&self) -> &'static str {
        "reading-order"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let Some(model) = ctx.model else {
            return Vec::new();
        };
        model
            .content_documents()
            .filter(|item| !item.is_nav() && !model.spine().references(&item.id))
            .map(|item| {
                Diagnostic::warning(
                    "CONTENT_NOT_IN_SPINE",
                    format!(
                        "Content document '{}' is not in the spine (unreachable in linear reading).",
                        item.href
                    ),
                )
                .at(&item.href)
                .spec("EPUB 3.3 § 4.3")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, ArchiveLimits};
    use crate::package::PackageModel;
    use crate::test_support::{clean_book, nav_doc, opf, xhtml, ZipBuilder};
    use crate::validate::ValidationOptions;

    fn run_check(check: &dyn Check, builder: ZipBuilder) -> Vec<Diagnostic> {
        let archive = Archive::from_bytes(builder.build(), ArchiveLimits::default()).unwrap();
        let model = PackageModel::build(&archive).ok();
        let documents = DocumentSet::load(&archive, model.as_ref());
        let options = ValidationOptions::default();
        let ctx = CheckContext {
            archive: &archive,
            model: model.as_ref(),
            documents: &documents,
            options: &options,
        };
        check.run(&ctx)
    }

    fn two_chapters(ch1: &str, ch2: &str) -> ZipBuilder {
        let manifest = r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="ch2.xhtml" media-type="application/xhtml+xml"/>"#;
        ZipBuilder::epub(&opf("3.0", manifest, r#"<itemref idref="c1"/><itemref idref="c2"/>"#))
            .deflated("OEBPS/nav.xhtml", nav_doc(&["ch1.xhtml"]).as_bytes())
            .deflated("OEBPS/ch1.xhtml", xhtml(ch1).as_bytes())
            .deflated("OEBPS/ch2.xhtml", xhtml(ch2).as_bytes())
    }

    #[test]
    fn test_clean_book_has_no_consistency_findings() {
        for check in [
            &PackageStructure as &dyn Check,
            &NavigationPresence,
            &IdentifierUniqueness,
            &LinkResolution,
            &ReadingOrder,
        ] {
            let found = run_check(check, clean_book());
            assert!(found.is_empty(), "{}: {:?}", check.name(), found);
        }
    }

    #[test]
    fn test_duplicate_id_within_document_is_error() {
        let found = run_check(
            &IdentifierUniqueness,
            two_chapters(r#"<p id="intro">a</p><p id="intro">b</p>"#, "<p>x</p>"),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "ID_DUPLICATE");
        assert_eq!(found[0].severity, crate::Severity::Error);
    }

    #[test]
    fn test_duplicate_id_across_documents_is_warning() {
        let found = run_check(
            &IdentifierUniqueness,
            two_chapters(r#"<p id="intro">a</p>"#, r#"<p id="intro">b</p>"#),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "ID_DUPLICATE_CROSS_DOCUMENT");
        assert_eq!(found[0].severity, crate::Severity::Warn);
    }

    #[test]
    fn test_broken_link_names_target() {
        let found = run_check(
            &LinkResolution,
            two_chapters(r#"<a href="chapter99.xhtml">gone</a>"#, "<p>x</p>"),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "LINK_BROKEN");
        assert!(found[0].message.contains("chapter99.xhtml"));
        assert_eq!(found[0].location.path.as_deref(), Some("OEBPS/ch1.xhtml"));
    }

    #[test]
    fn test_broken_nav_entry_reported_once() {
        let manifest = r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>"#;
        let book = || {
            ZipBuilder::epub(&opf("3.0", manifest, r#"<itemref idref="c1"/>"#))
                .deflated("OEBPS/nav.xhtml", nav_doc(&["ch1.xhtml", "missing.xhtml"]).as_bytes())
                .deflated("OEBPS/ch1.xhtml", xhtml(r#"<a href="gone.xhtml">x</a>"#).as_bytes())
        };
        let links = run_check(&LinkResolution, book());
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].code, "LINK_BROKEN");
        assert_eq!(links[0].location.path.as_deref(), Some("OEBPS/ch1.xhtml"));

        let nav = run_check(&NavigationPresence, book());
        let codes: Vec<&str> = nav.iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["NAV_TARGET_MISSING"]);
    }

    #[test]
    fn test_fragment_links() {
        let found = run_check(
            &LinkResolution,
            two_chapters(
                r##"<a href="ch2.xhtml#there">ok</a> <a href="ch2.xhtml#nowhere">bad</a> <a href="#self">self</a> <a href="https://example.com/#x">ext</a> <a href="ch%32.xhtml">encoded</a>"##,
                r#"<h1 id="there">x</h1>"#,
            ),
        );
        let codes: Vec<&str> = found.iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["LINK_FRAGMENT_MISSING", "LINK_FRAGMENT_MISSING"]);
        assert!(found[0].message.contains("nowhere"));
        assert!(found[1].message.contains("self"));
    }

    #[test]
    fn test_missing_nav_document_is_error() {
        let manifest = r#"<item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>"#;
        let builder = ZipBuilder::epub(&opf("3.0", manifest, r#"<itemref idref="c1"/>"#))
            .deflated("OEBPS/ch1.xhtml", xhtml("<p>x</p>").as_bytes());
        let found = run_check(&NavigationPresence, builder);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "NAV_DOCUMENT_MISSING");
        assert_eq!(found[0].severity, crate::Severity::Error);
        assert_eq!(found[0].spec_ref, Some(SPEC_NAV));
    }

    #[test]
    fn test_legacy_with_only_nav_document_is_warning() {
        let manifest = r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>"#;
        let builder = ZipBuilder::epub(&opf("2.0", manifest, r#"<itemref idref="c1"/>"#))
            .deflated("OEBPS/nav.xhtml", nav_doc(&["ch1.xhtml"]).as_bytes())
            .deflated("OEBPS/ch1.xhtml", xhtml("<p>x</p>").as_bytes());
        let found = run_check(&NavigationPresence, builder);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "NCX_MISSING");
        assert_eq!(found[0].severity, crate::Severity::Warn);
    }

    #[test]
    fn test_nav_entries_resolve() {
        let manifest = r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>"#;
        let builder = ZipBuilder::epub(&opf("3.0", manifest, r#"<itemref idref="c1"/>"#))
            .deflated(
                "OEBPS/nav.xhtml",
                nav_doc(&["ch1.xhtml#top", "ch1.xhtml#gone", "missing.xhtml"]).as_bytes(),
            )
            .deflated("OEBPS/ch1.xhtml", xhtml(r#"<h1 id="top">x</h1>"#).as_bytes());
        let found = run_check(&NavigationPresence, builder);
        let codes: Vec<&str> = found.iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["NAV_FRAGMENT_MISSING", "NAV_TARGET_MISSING"]);
    }

    #[test]
    fn test_orphaned_content_document() {
        let manifest = r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="ch2.xhtml" media-type="application/xhtml+xml"/>"#;
        let builder = ZipBuilder::epub(&opf("3.0", manifest, r#"<itemref idref="c1"/>"#))
            .deflated("OEBPS/nav.xhtml", nav_doc(&["ch1.xhtml"]).as_bytes())
            .deflated("OEBPS/ch1.xhtml", xhtml("<p>x</p>").as_bytes())
            .deflated("OEBPS/ch2.xhtml", xhtml("<p>y</p>").as_bytes());
        let found = run_check(&ReadingOrder, builder);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "CONTENT_NOT_IN_SPINE");
        assert_eq!(found[0].location.path.as_deref(), Some("OEBPS/ch2.xhtml"));
    }
}
