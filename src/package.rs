//! Package model builder
//!
//! Turns the flat archive into the logical book: container pointer, package
//! document (metadata, manifest, spine) and the navigation file the package
//! generation calls for. Structural problems found while cross-referencing
//! those pieces are kept on the model as diagnostics; only failures that
//! leave no model at all are returned as [`ModelError`].

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::archive::Archive;
use crate::diagnostic::Diagnostic;
use crate::error::ModelError;
use crate::metadata::{parse_container_xml, parse_opf, ManifestItem, PackageMetadata};
use crate::navigation::{parse_nav_xhtml, parse_ncx, NavigationModel};
use crate::path::{is_external, normalize_archive_path};
use crate::spine::{parse_spine, Spine};

/// Fixed location of the container pointer file.
pub const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Package format generation, selected from `package@version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Generation {
    /// EPUB 2.x: NCX table of contents
    Legacy,
    /// EPUB 3.x: XHTML navigation document
    Modern,
}

impl Generation {
    /// Major version 3 and above is modern; anything else, including a
    /// missing or unparseable version, is treated as legacy.
    pub fn from_version(version: &str) -> Self {
        let major = version
            .trim()
            .split('.')
            .next()
            .and_then(|m| m.parse::<u32>().ok())
            .unwrap_or(0);
        if major >= 3 {
            Generation::Modern
        } else {
            Generation::Legacy
        }
    }
}

/// The logical book reconstructed from one archive.
#[derive(Clone, Debug)]
pub struct PackageModel {
    opf_path: String,
    version: String,
    generation: Generation,
    metadata: PackageMetadata,
    manifest: Vec<ManifestItem>,
    by_id: HashMap<String, usize>,
    spine: Spine,
    navigation: Option<NavigationModel>,
    extra_rootfiles: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl PackageModel {
    /// Build the model from an opened archive.
    pub fn build(archive: &Archive) -> Result<Self, ModelError> {
        if !archive.contains(CONTAINER_PATH) {
            let detail = match archive.find_case_insensitive(CONTAINER_PATH) {
                Some(found) => format!(
                    "{} not found (found '{}' with different case)",
                    CONTAINER_PATH, found
                ),
                None => format!("{} not found", CONTAINER_PATH),
            };
            return Err(ModelError::MissingContainerPointer(detail));
        }
        let container = archive.read(CONTAINER_PATH)?;
        let rootfiles = parse_container_xml(&container).map_err(|e| ModelError::MalformedXml {
            path: CONTAINER_PATH.to_string(),
            message: e.to_string(),
        })?;
        let Some((first, rest)) = rootfiles.split_first() else {
            return Err(ModelError::MissingContainerPointer(format!(
                "{} declares no rootfile",
                CONTAINER_PATH
            )));
        };

        let opf_path = normalize_archive_path(first)?;
        if !archive.contains(&opf_path) {
            return Err(ModelError::MissingPackageDocument(opf_path));
        }
        let opf = archive.read(&opf_path)?;
        let malformed = |e: crate::error::EpubLintError| ModelError::MalformedXml {
            path: opf_path.clone(),
            message: e.to_string(),
        };
        let doc = parse_opf(&opf, &opf_path).map_err(malformed)?;
        let spine = parse_spine(&opf).map_err(malformed)?;
        debug!(
            "[PACKAGE] {} version={} manifest={} spine={}",
            opf_path,
            doc.version,
            doc.manifest.len(),
            spine.len()
        );

        let mut model = PackageModel {
            generation: Generation::from_version(&doc.version),
            version: doc.version,
            metadata: doc.metadata,
            manifest: Vec::with_capacity(doc.manifest.len()),
            by_id: HashMap::new(),
            spine,
            navigation: None,
            extra_rootfiles: rest.to_vec(),
            diagnostics: Vec::new(),
            opf_path,
        };

        if !model.extra_rootfiles.is_empty() {
            model.diagnostics.push(
                Diagnostic::info(
                    "OPF_ROOTFILE_EXTRA",
                    format!(
                        "Container declares {} additional package document(s); only '{}' is validated",
                        model.extra_rootfiles.len(),
                        model.opf_path
                    ),
                )
                .at(CONTAINER_PATH)
                .spec("EPUB OCF 3.0 § 3.5.1"),
            );
        }

        model.index_manifest(doc.manifest, archive);
        model.check_spine();
        model.navigation = model.load_navigation(archive);
        Ok(model)
    }

    fn index_manifest(&mut self, items: Vec<ManifestItem>, archive: &Archive) {
        let mut hrefs: HashSet<String> = HashSet::new();
        for item in items {
            if item.id.trim().is_empty() {
                self.diagnostics.push(
                    Diagnostic::error("MANIFEST_ID_EMPTY", "Manifest item has empty `id` attribute.")
                        .at(&self.opf_path)
                        .hint(format!("Item href: '{}'", item.raw_href)),
                );
            }
            if item.raw_href.trim().is_empty() {
                self.diagnostics.push(
                    Diagnostic::error(
                        "MANIFEST_HREF_EMPTY",
                        format!("Manifest item '{}' has empty `href`.", item.id),
                    )
                    .at(&self.opf_path),
                );
            }
            if item.media_type.trim().is_empty() {
                self.diagnostics.push(
                    Diagnostic::error(
                        "MANIFEST_MEDIA_TYPE_EMPTY",
                        format!("Manifest item '{}' has empty `media-type`.", item.id),
                    )
                    .at(&self.opf_path),
                );
            }
            if item.id.trim().is_empty() {
                continue;
            }

            if self.by_id.contains_key(&item.id) {
                self.diagnostics.push(
                    Diagnostic::error(
                        "MANIFEST_ID_DUPLICATE",
                        format!("Duplicate manifest id '{}'.", item.id),
                    )
                    .at(&self.opf_path)
                    .spec("XML 1.0 § 3.3.1")
                    .hint("Give every manifest item a unique id; only the first is used."),
                );
                continue;
            }

            if !item.href.is_empty() {
                if !hrefs.insert(item.href.to_ascii_lowercase()) {
                    self.diagnostics.push(
                        Diagnostic::warning(
                            "MANIFEST_HREF_DUPLICATE",
                            format!("Multiple manifest items reference href '{}'.", item.href),
                        )
                        .at(&self.opf_path),
                    );
                }
                if !archive.contains(&item.href) {
                    let mut d = Diagnostic::error(
                        "MANIFEST_RESOURCE_MISSING",
                        format!(
                            "Manifest item '{}' points to missing resource '{}'.",
                            item.id, item.href
                        ),
                    )
                    .at(&self.opf_path);
                    if let Some(found) = archive.find_case_insensitive(&item.href) {
                        d = d.hint(format!("Archive contains '{}' with different case.", found));
                    }
                    self.diagnostics.push(d);
                }
            } else if !item.raw_href.trim().is_empty() && !is_external(&item.raw_href) {
                self.diagnostics.push(
                    Diagnostic::error(
                        "MANIFEST_HREF_ESCAPE",
                        format!(
                            "Manifest item '{}' href '{}' resolves outside the archive.",
                            item.id, item.raw_href
                        ),
                    )
                    .at(&self.opf_path),
                );
            }

            self.by_id.insert(item.id.clone(), self.manifest.len());
            self.manifest.push(item);
        }

        if !self.manifest.iter().any(ManifestItem::is_content_document) {
            self.diagnostics.push(
                Diagnostic::error(
                    "MANIFEST_NO_CONTENT",
                    "Manifest declares no XHTML content documents.",
                )
                .at(&self.opf_path),
            );
        }
        self.check_fallbacks();
    }

    fn check_fallbacks(&mut self) {
        let mut found = Vec::new();
        for item in &self.manifest {
            if !is_core_media_type(&item.media_type)
                && item.fallback.is_none()
                && self.spine.references(&item.id)
            {
                found.push(
                    Diagnostic::warning(
                        "MANIFEST_FOREIGN_NO_FALLBACK",
                        format!(
                            "Spine item '{}' has non-core media-type '{}' without fallback.",
                            item.id, item.media_type
                        ),
                    )
                    .at(&self.opf_path)
                    .hint("Add `fallback=\"...\"` to a supported content-document representation."),
                );
            }

            let Some(fallback_id) = item.fallback.as_deref() else {
                continue;
            };
            if fallback_id == item.id {
                found.push(
                    Diagnostic::error(
                        "MANIFEST_FALLBACK_SELF_REFERENCE",
                        format!("Manifest item '{}' fallback points to itself.", item.id),
                    )
                    .at(&self.opf_path),
                );
                continue;
            }
            if self.item(fallback_id).is_none() {
                found.push(
                    Diagnostic::error(
                        "MANIFEST_FALLBACK_TARGET_MISSING",
                        format!(
                            "Manifest item '{}' fallback references missing id '{}'.",
                            item.id, fallback_id
                        ),
                    )
                    .at(&self.opf_path),
                );
                continue;
            }

            let mut seen = HashSet::new();
            let mut cursor = fallback_id;
            while let Some(next) = self.item(cursor).and_then(|i| i.fallback.as_deref()) {
                if !seen.insert(cursor) {
                    found.push(
                        Diagnostic::error(
                            "MANIFEST_FALLBACK_CYCLE",
                            format!(
                                "Fallback chain from '{}' contains a cycle at id '{}'.",
                                item.id, cursor
                            ),
                        )
                        .at(&self.opf_path),
                    );
                    break;
                }
                cursor = next;
            }
        }
        self.diagnostics.extend(found);
    }

    fn check_spine(&mut self) {
        if self.spine.is_empty() {
            self.diagnostics.push(
                Diagnostic::warning("SPINE_EMPTY", "Spine has no reading-order entries.")
                    .at(&self.opf_path)
                    .spec("EPUB 3.3 § 4.3"),
            );
            return;
        }

        let mut found = Vec::new();
        for itemref in self.spine.items() {
            if itemref.has_invalid_linear() {
                found.push(
                    Diagnostic::error(
                        "SPINE_LINEAR_INVALID",
                        format!(
                            "Spine itemref '{}' has invalid linear value '{}'",
                            itemref.idref,
                            itemref.linear.as_deref().unwrap_or_default()
                        ),
                    )
                    .at_line(&self.opf_path, itemref.line)
                    .hint("linear must be 'yes' or 'no'"),
                );
            }
            match self.item(&itemref.idref) {
                None => found.push(
                    Diagnostic::error(
                        "SPINE_IDREF_NOT_IN_MANIFEST",
                        format!(
                            "Spine itemref '{}' does not match any manifest item",
                            itemref.idref
                        ),
                    )
                    .at_line(&self.opf_path, itemref.line)
                    .spec("EPUB 3.3 § 4.3"),
                ),
                Some(item) if !item.is_content_document() => found.push(
                    Diagnostic::warning(
                        "SPINE_ITEM_NON_XHTML",
                        format!(
                            "Spine item '{}' has media type '{}' instead of XHTML",
                            item.id, item.media_type
                        ),
                    )
                    .at_line(&self.opf_path, itemref.line),
                ),
                Some(_) => {}
            }
        }
        self.diagnostics.extend(found);
    }

    /// Pick and parse the navigation file matching the generation, falling
    /// back to the other form when the preferred one is absent.
    fn load_navigation(&mut self, archive: &Archive) -> Option<NavigationModel> {
        let nav_doc = self.nav_items().next().map(|item| item.href.clone());
        let ncx = self.ncx_item().map(|item| item.href.clone());

        let candidates = match self.generation {
            Generation::Modern => [(nav_doc, false), (ncx, true)],
            Generation::Legacy => [(ncx, true), (nav_doc, false)],
        };
        for (path, is_ncx) in candidates {
            let Some(path) = path.filter(|p| !p.is_empty() && archive.contains(p)) else {
                continue;
            };
            let Ok(bytes) = archive.read(&path) else {
                continue;
            };
            let parsed = if is_ncx {
                parse_ncx(&bytes)
            } else {
                parse_nav_xhtml(&bytes)
            };
            match parsed {
                Ok(navigation) if is_ncx => return Some(NavigationModel::Ncx { path, navigation }),
                Ok(navigation) => return Some(NavigationModel::NavDocument { path, navigation }),
                Err(err) => {
                    let (code, kind) = if is_ncx {
                        ("NCX_PARSE_ERROR", "NCX document")
                    } else {
                        ("NAV_DOCUMENT_PARSE_ERROR", "nav document")
                    };
                    self.diagnostics.push(
                        Diagnostic::error(code, format!("Failed to parse {}: {}", kind, err))
                            .at(path),
                    );
                }
            }
        }
        None
    }

    /// Archive path of the package document.
    pub fn opf_path(&self) -> &str {
        &self.opf_path
    }

    /// `package@version` as written.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Format generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Package metadata.
    pub fn metadata(&self) -> &PackageMetadata {
        &self.metadata
    }

    /// Manifest items in document order; duplicate ids keep only the first.
    pub fn manifest(&self) -> &[ManifestItem] {
        &self.manifest
    }

    /// Look up a manifest item by id.
    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.by_id.get(id).map(|&i| &self.manifest[i])
    }

    /// Look up a manifest item by its normalized archive path.
    pub fn item_by_path(&self, path: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.href == path)
    }

    /// Spine in reading order.
    pub fn spine(&self) -> &Spine {
        &self.spine
    }

    /// Spine items resolved to their manifest entries. Unresolved itemrefs
    /// are skipped.
    pub fn reading_order(&self) -> impl Iterator<Item = &ManifestItem> + '_ {
        self.spine
            .items()
            .iter()
            .filter_map(move |itemref| self.item(&itemref.idref))
    }

    /// XHTML content documents present in the manifest with an archive path.
    pub fn content_documents(&self) -> impl Iterator<Item = &ManifestItem> + '_ {
        self.manifest
            .iter()
            .filter(|item| item.is_content_document() && !item.href.is_empty())
    }

    /// Manifest items flagged with the `nav` property.
    pub fn nav_items(&self) -> impl Iterator<Item = &ManifestItem> + '_ {
        self.manifest.iter().filter(|item| item.is_nav())
    }

    /// The NCX: the item named by `spine@toc`, else any NCX-typed item.
    pub fn ncx_item(&self) -> Option<&ManifestItem> {
        self.spine
            .toc_id()
            .and_then(|id| self.item(id))
            .or_else(|| self.manifest.iter().find(|item| item.is_ncx()))
    }

    /// Parsed navigation, if a navigation file was found and well-formed.
    pub fn navigation(&self) -> Option<&NavigationModel> {
        self.navigation.as_ref()
    }

    /// Rootfiles declared after the first one; recorded, never followed.
    pub fn extra_rootfiles(&self) -> &[String] {
        &self.extra_rootfiles
    }

    /// Structural findings made while building the model.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

fn is_core_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        "application/xhtml+xml"
            | "application/x-dtbncx+xml"
            | "text/css"
            | "image/gif"
            | "image/jpeg"
            | "image/png"
            | "image/svg+xml"
            | "image/webp"
            | "font/otf"
            | "font/ttf"
            | "font/woff"
            | "font/woff2"
            | "application/vnd.ms-opentype"
            | "application/font-woff"
            | "audio/mpeg"
            | "audio/mp4"
            | "video/mp4"
            | "application/smil+xml"
            | "application/pls+xml"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveLimits;
    use crate::test_support::{clean_book, opf, xhtml, ZipBuilder, CONTAINER_XML};

    fn model_of(builder: ZipBuilder) -> Result<PackageModel, ModelError> {
        let archive = Archive::from_bytes(builder.build(), ArchiveLimits::default()).unwrap();
        PackageModel::build(&archive)
    }

    fn codes(model: &PackageModel) -> Vec<&'static str> {
        model.diagnostics().iter().map(|d| d.code).collect()
    }

    #[test]
    fn test_generation_from_version() {
        assert_eq!(Generation::from_version("3.0"), Generation::Modern);
        assert_eq!(Generation::from_version("3.3"), Generation::Modern);
        assert_eq!(Generation::from_version("2.0.1"), Generation::Legacy);
        assert_eq!(Generation::from_version(""), Generation::Legacy);
    }

    #[test]
    fn test_clean_book_builds_without_findings() {
        let model = model_of(clean_book()).unwrap();
        assert_eq!(model.opf_path(), "OEBPS/content.opf");
        assert_eq!(model.generation(), Generation::Modern);
        assert!(model.diagnostics().is_empty(), "{:?}", model.diagnostics());
        let order: Vec<&str> = model.reading_order().map(|i| i.id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2"]);
        let nav = model.navigation().unwrap();
        assert_eq!(nav.path(), "OEBPS/nav.xhtml");
        assert_eq!(nav.entries().len(), 2);
    }

    #[test]
    fn test_missing_container_pointer() {
        let builder = ZipBuilder::new().stored("mimetype", b"application/epub+zip");
        match model_of(builder) {
            Err(ModelError::MissingContainerPointer(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_package_document() {
        let builder = ZipBuilder::new()
            .stored("mimetype", b"application/epub+zip")
            .deflated("META-INF/container.xml", CONTAINER_XML.as_bytes());
        assert_eq!(
            model_of(builder).unwrap_err(),
            ModelError::MissingPackageDocument("OEBPS/content.opf".into())
        );
    }

    #[test]
    fn test_malformed_package_document() {
        let builder = ZipBuilder::epub("<package><metadata></package>");
        match model_of(builder) {
            Err(ModelError::MalformedXml { path, .. }) => assert_eq!(path, "OEBPS/content.opf"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_structural_findings() {
        let manifest = r#"<item id="c1" href="c1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c1" href="other.xhtml" media-type="application/xhtml+xml"/>
    <item id="gone" href="gone.xhtml" media-type="application/xhtml+xml"/>
    <item id="img" href="c1.xhtml" media-type="image/png"/>
    <item id="" href="x.css" media-type="text/css"/>"#;
        let spine = r#"<itemref idref="c1" linear="sometimes"/>
    <itemref idref="nowhere"/>
    <itemref idref="img"/>"#;
        let builder = ZipBuilder::epub(&opf("3.0", manifest, spine))
            .deflated("OEBPS/c1.xhtml", xhtml("<p>x</p>").as_bytes());
        let model = model_of(builder).unwrap();
        let codes = codes(&model);
        for expected in [
            "MANIFEST_ID_DUPLICATE",
            "MANIFEST_RESOURCE_MISSING",
            "MANIFEST_HREF_DUPLICATE",
            "MANIFEST_ID_EMPTY",
            "SPINE_LINEAR_INVALID",
            "SPINE_IDREF_NOT_IN_MANIFEST",
            "SPINE_ITEM_NON_XHTML",
        ] {
            assert!(codes.contains(&expected), "missing {} in {:?}", expected, codes);
        }
        // First occurrence wins
        assert_eq!(model.item("c1").unwrap().href, "OEBPS/c1.xhtml");
        let unresolved = model
            .diagnostics()
            .iter()
            .find(|d| d.code == "SPINE_IDREF_NOT_IN_MANIFEST")
            .unwrap();
        assert!(unresolved.location.line.is_some());
    }

    #[test]
    fn test_extra_rootfiles_recorded_not_followed() {
        let container = r#"<container><rootfiles>
  <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  <rootfile full-path="alt/other.opf" media-type="application/oebps-package+xml"/>
</rootfiles></container>"#;
        let manifest = r#"<item id="c1" href="c1.xhtml" media-type="application/xhtml+xml"/>"#;
        let builder = ZipBuilder::new()
            .stored("mimetype", b"application/epub+zip")
            .deflated("META-INF/container.xml", container.as_bytes())
            .deflated("OEBPS/content.opf", opf("3.0", manifest, r#"<itemref idref="c1"/>"#).as_bytes())
            .deflated("OEBPS/c1.xhtml", xhtml("<p>x</p>").as_bytes());
        let model = model_of(builder).unwrap();
        assert_eq!(model.extra_rootfiles(), ["alt/other.opf".to_string()]);
        assert!(codes(&model).contains(&"OPF_ROOTFILE_EXTRA"));
    }

    #[test]
    fn test_legacy_book_uses_ncx() {
        let manifest = r#"<item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="c1" href="c1.xhtml" media-type="application/xhtml+xml"/>"#;
        let ncx = r#"<ncx><navMap><navPoint id="n1"><navLabel><text>One</text></navLabel><content src="c1.xhtml"/></navPoint></navMap></ncx>"#;
        let builder = ZipBuilder::epub(&opf("2.0", manifest, r#"<itemref idref="c1"/>"#))
            .deflated("OEBPS/toc.ncx", ncx.as_bytes())
            .deflated("OEBPS/c1.xhtml", xhtml("<p>x</p>").as_bytes());
        let model = model_of(builder).unwrap();
        assert_eq!(model.generation(), Generation::Legacy);
        assert_eq!(model.spine().toc_id(), Some("ncx"));
        match model.navigation() {
            Some(NavigationModel::Ncx { path, navigation }) => {
                assert_eq!(path, "OEBPS/toc.ncx");
                assert_eq!(navigation.toc[0].label, "One");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fallback_chains() {
        let manifest = r#"<item id="c1" href="c1.xhtml" media-type="application/xhtml+xml"/>
    <item id="doc" href="doc.pdf" media-type="application/pdf"/>
    <item id="a" href="a.xml" media-type="application/xml" fallback="b"/>
    <item id="b" href="b.xml" media-type="application/xml" fallback="a"/>
    <item id="self" href="s.xml" media-type="application/xml" fallback="self"/>
    <item id="lost" href="l.xml" media-type="application/xml" fallback="nope"/>"#;
        let spine = r#"<itemref idref="c1"/><itemref idref="doc"/>"#;
        let mut builder = ZipBuilder::epub(&opf("3.0", manifest, spine))
            .deflated("OEBPS/c1.xhtml", xhtml("<p>x</p>").as_bytes());
        for name in ["doc.pdf", "a.xml", "b.xml", "s.xml", "l.xml"] {
            builder = builder.stored(&format!("OEBPS/{}", name), b"x");
        }
        let model = model_of(builder).unwrap();
        let codes = codes(&model);
        for expected in [
            "MANIFEST_FOREIGN_NO_FALLBACK",
            "MANIFEST_FALLBACK_CYCLE",
            "MANIFEST_FALLBACK_SELF_REFERENCE",
            "MANIFEST_FALLBACK_TARGET_MISSING",
        ] {
            assert!(codes.contains(&expected), "missing {} in {:?}", expected, codes);
        }
    }

    #[test]
    fn test_empty_spine_and_no_content() {
        let manifest = r#"<item id="css" href="s.css" media-type="text/css"/>"#;
        let builder = ZipBuilder::epub(&opf("3.0", manifest, "")).deflated("OEBPS/s.css", b"p{}");
        let model = model_of(builder).unwrap();
        let codes = codes(&model);
        assert!(codes.contains(&"SPINE_EMPTY"));
        assert!(codes.contains(&"MANIFEST_NO_CONTENT"));
    }
}
