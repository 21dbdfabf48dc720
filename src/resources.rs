//! Resource rules: images, cover, fonts and media.
//!
//! Image dimensions are read from the file header only (PNG `IHDR`, JPEG
//! start-of-frame, GIF logical screen); nothing is decoded.

use log::warn;

use crate::check::{par_map, Check, CheckContext, DocumentOutcome};
use crate::diagnostic::{Diagnostic, Platform};
use crate::metadata::ManifestItem;
use crate::package::{Generation, PackageModel};
use crate::rules::RuleThresholds;

const SPEC_COVER: &str = "EPUB 3.3 § 5.6.4";
const MIB: f64 = 1024.0 * 1024.0;

/// Pixel dimensions read from an image header.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    png_dimensions(bytes)
        .or_else(|| jpeg_dimensions(bytes))
        .or_else(|| gif_dimensions(bytes))
}

fn nonzero(width: u32, height: u32) -> Option<(u32, u32)> {
    (width > 0 && height > 0).then_some((width, height))
}

fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
    if bytes.len() < 24 || &bytes[..8] != SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    nonzero(width, height)
}

fn gif_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 10 || (&bytes[..6] != b"GIF87a" && &bytes[..6] != b"GIF89a") {
        return None;
    }
    let width = u16::from_le_bytes([bytes[6], bytes[7]]);
    let height = u16::from_le_bytes([bytes[8], bytes[9]]);
    nonzero(width.into(), height.into())
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }
    let mut i = 2usize;
    while i + 1 < bytes.len() {
        while i < bytes.len() && bytes[i] != 0xFF {
            i += 1;
        }
        while i < bytes.len() && bytes[i] == 0xFF {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let marker = bytes[i];
        i += 1;
        // End of image, start of scan
        if marker == 0xD9 || marker == 0xDA || i + 1 >= bytes.len() {
            break;
        }
        let seg_len = u16::from_be_bytes([bytes[i], bytes[i + 1]]) as usize;
        let payload = i + 2;
        let seg_end = i.saturating_add(seg_len);
        if seg_len < 2 || seg_end > bytes.len() {
            break;
        }
        if is_sof_marker(marker) && seg_len >= 7 {
            let height = u16::from_be_bytes([bytes[payload + 1], bytes[payload + 2]]);
            let width = u16::from_be_bytes([bytes[payload + 3], bytes[payload + 4]]);
            return nonzero(width.into(), height.into());
        }
        i = seg_end;
    }
    None
}

fn is_sof_marker(marker: u8) -> bool {
    matches!(
        marker,
        0xC0 | 0xC1 | 0xC2 | 0xC3 | 0xC5 | 0xC6 | 0xC7 | 0xC9 | 0xCA | 0xCB | 0xCD | 0xCE | 0xCF
    )
}

fn is_font_woff(item: &ManifestItem) -> bool {
    matches!(
        item.media_type.as_str(),
        "font/woff" | "font/woff2" | "application/font-woff" | "application/font-woff2"
    ) || [".woff", ".woff2"]
        .iter()
        .any(|ext| item.href.to_ascii_lowercase().ends_with(ext))
}

/// Image, cover, font and media checks over the manifest.
pub struct ResourceRules;

impl ResourceRules {
    /// Size and dimension checks for one image item.
    fn check_image(
        ctx: &CheckContext<'_>,
        item: &ManifestItem,
        thresholds: &RuleThresholds,
    ) -> DocumentOutcome {
        let mut out = Vec::new();
        let Some(entry) = ctx.archive.entry(&item.href) else {
            return DocumentOutcome::Checked(out);
        };
        if entry.refusal().is_some() {
            return DocumentOutcome::Checked(out);
        }

        let size = entry.uncompressed_size;
        if size > thresholds.image_warn_bytes {
            let limit = if size > thresholds.image_large_bytes {
                thresholds.image_large_bytes
            } else {
                thresholds.image_warn_bytes
            };
            out.push(
                Diagnostic::warning(
                    "IMAGE_FILE_SIZE",
                    format!(
                        "Image '{}' is {:.1} MB (above {:.0} MB); large images slow down page turns.",
                        item.href,
                        size as f64 / MIB,
                        limit as f64 / MIB
                    ),
                )
                .at(&item.href),
            );
        }

        match item.media_type.as_str() {
            "image/svg+xml" => {
                for platform in [Platform::Eink, Platform::Kindle] {
                    out.push(
                        Diagnostic::warning(
                            "IMAGE_SVG",
                            format!("SVG image '{}' may not render.", item.href),
                        )
                        .on(platform)
                        .at(&item.href)
                        .hint("Provide a PNG or JPEG version."),
                    );
                }
            }
            "image/gif" => out.push(
                Diagnostic::warning(
                    "IMAGE_GIF",
                    format!("GIF image '{}' loses animation and colour depth on Kindle.", item.href),
                )
                .on(Platform::Kindle)
                .at(&item.href),
            ),
            "image/png" | "image/jpeg" => {
                let bytes = match ctx.archive.read(&item.href) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("[CHECK] could not read image '{}': {}", item.href, err);
                        return DocumentOutcome::Failed(
                            Diagnostic::warning(
                                "RESOURCE_UNREADABLE",
                                format!("Could not read image '{}': {}", item.href, err),
                            )
                            .at(&item.href),
                        );
                    }
                };
                if let Some((w, h)) = image_dimensions(&bytes) {
                    if w > thresholds.image_max_width || h > thresholds.image_max_height {
                        out.push(
                            Diagnostic::warning(
                                "IMAGE_DIMENSIONS",
                                format!(
                                    "Image '{}' is {}x{} px (above {}x{}).",
                                    item.href,
                                    w,
                                    h,
                                    thresholds.image_max_width,
                                    thresholds.image_max_height
                                ),
                            )
                            .at(&item.href)
                            .hint("Downscale the image; readers resample it anyway."),
                        );
                    }
                }
            }
            _ => {}
        }
        DocumentOutcome::Checked(out)
    }

    fn check_cover(ctx: &CheckContext<'_>, model: &PackageModel, out: &mut Vec<Diagnostic>) {
        let opf = model.opf_path();
        let flagged: Vec<&ManifestItem> = model
            .manifest()
            .iter()
            .filter(|item| item.has_property("cover-image"))
            .collect();

        let cover = match flagged.as_slice() {
            [] => match model.metadata().cover_meta.as_deref() {
                Some(id) => match model.item(id) {
                    Some(item) => {
                        if model.generation() == Generation::Modern {
                            out.push(
                                Diagnostic::warning(
                                    "COVER_NOT_FLAGGED",
                                    format!(
                                        "Cover '{}' is only named by <meta name=\"cover\">; it is not flagged cover-image.",
                                        item.href
                                    ),
                                )
                                .at(opf)
                                .spec(SPEC_COVER)
                                .hint(format!("Add properties=\"cover-image\" to item '{}'.", item.id)),
                            );
                        }
                        Some(item)
                    }
                    None => {
                        out.push(
                            Diagnostic::warning(
                                "COVER_META_INVALID",
                                format!("<meta name=\"cover\"> names unknown manifest id '{}'.", id),
                            )
                            .at(opf),
                        );
                        None
                    }
                },
                None => {
                    out.push(
                        Diagnostic::warning("COVER_MISSING", "No cover image is declared.")
                            .at(opf)
                            .spec(SPEC_COVER)
                            .hint("Flag the cover image with properties=\"cover-image\"."),
                    );
                    None
                }
            },
            [item] => Some(*item),
            many => {
                out.push(
                    Diagnostic::error(
                        "COVER_MULTIPLE",
                        format!(
                            "{} manifest items are flagged cover-image: {}",
                            many.len(),
                            many.iter().map(|i| i.id.as_str()).collect::<Vec<_>>().join(", ")
                        ),
                    )
                    .at(opf)
                    .spec(SPEC_COVER),
                );
                None
            }
        };

        let Some(cover) = cover else { return };
        if cover.href.is_empty() || !ctx.archive.contains(&cover.href) {
            return;
        }
        let t = &ctx.options.thresholds;
        let dimensions = ctx
            .archive
            .read(&cover.href)
            .ok()
            .and_then(|bytes| image_dimensions(&bytes));
        if let Some((w, h)) = dimensions {
            if w < t.cover_min_width || h < t.cover_min_height {
                out.push(
                    Diagnostic::warning(
                        "COVER_TOO_SMALL",
                        format!(
                            "Cover '{}' is {}x{} px (below {}x{}).",
                            cover.href, w, h, t.cover_min_width, t.cover_min_height
                        ),
                    )
                    .at(&cover.href),
                );
            }
        }
    }

    fn check_item(item: &ManifestItem, out: &mut Vec<Diagnostic>) {
        if is_font_woff(item) {
            for platform in [Platform::Kindle, Platform::Eink] {
                out.push(
                    Diagnostic::warning(
                        "FONT_WOFF",
                        format!("WOFF font '{}' is not supported.", item.href),
                    )
                    .on(platform)
                    .at(&item.href)
                    .hint("Embed the font as TrueType or OpenType."),
                );
            }
        }
        if item.media_type.starts_with("audio/") || item.media_type.starts_with("video/") {
            out.push(
                Diagnostic::error(
                    "MEDIA_AUDIO_VIDEO",
                    format!("Audio/video resource '{}' is dropped by Kindle conversion.", item.href),
                )
                .on(Platform::Kindle)
                .at(&item.href),
            );
            out.push(
                Diagnostic::warning(
                    "MEDIA_AUDIO_VIDEO",
                    format!("Audio/video resource '{}' is not played by most Android readers.", item.href),
                )
                .on(Platform::Android)
                .at(&item.href),
            );
        }
        if item.has_property("scripted") {
            out.push(
                Diagnostic::warning(
                    "SCRIPTED_CONTENT",
                    format!("'{}' is declared scripted; Apple Books limits scripting.", item.href),
                )
                .on(Platform::AppleBooks)
                .at(&item.href),
            );
        }
        if item.has_property("mathml") {
            for platform in [Platform::Eink, Platform::Android] {
                out.push(
                    Diagnostic::warning(
                        "MATHML_CONTENT",
                        format!("'{}' contains MathML, which may render as plain text.", item.href),
                    )
                    .on(platform)
                    .at(&item.href)
                    .hint("Provide an image fallback for equations."),
                );
            }
        }
    }
}

impl Check for ResourceRules {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let Some(model) = ctx.model else {
            return Vec::new();
        };
        let images: Vec<&ManifestItem> = model
            .manifest()
            .iter()
            .filter(|item| item.media_type.starts_with("image/") && !item.href.is_empty())
            .collect();
        let thresholds = &ctx.options.thresholds;

        let checked = par_map(&images, |item| Self::check_image(ctx, item, thresholds));
        let mut out: Vec<Diagnostic> = checked
            .into_iter()
            .flat_map(DocumentOutcome::into_diagnostics)
            .collect();
        Self::check_cover(ctx, model, &mut out);
        for item in model.manifest() {
            Self::check_item(item, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, ArchiveLimits};
    use crate::check::DocumentSet;
    use crate::test_support::{clean_book, opf, png_header, xhtml, ZipBuilder};
    use crate::validate::ValidationOptions;

    fn run(builder: ZipBuilder) -> Vec<Diagnostic> {
        let archive = Archive::from_bytes(builder.build(), ArchiveLimits::default()).unwrap();
        let model = PackageModel::build(&archive).unwrap();
        let documents = DocumentSet::load(&archive, Some(&model));
        let options = ValidationOptions::default();
        ResourceRules.run(&CheckContext {
            archive: &archive,
            model: Some(&model),
            documents: &documents,
            options: &options,
        })
    }

    fn book(extra_manifest: &str) -> ZipBuilder {
        let manifest = format!(
            r#"<item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    {}"#,
            extra_manifest
        );
        ZipBuilder::epub(&opf("3.0", &manifest, r#"<itemref idref="c1"/>"#))
            .deflated("OEBPS/ch1.xhtml", xhtml("<p/>").as_bytes())
    }

    fn jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut jpg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00];
        jpg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        jpg.extend_from_slice(&height.to_be_bytes());
        jpg.extend_from_slice(&width.to_be_bytes());
        jpg.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        jpg.extend_from_slice(&[0xFF, 0xD9]);
        jpg
    }

    #[test]
    fn test_header_dimensions() {
        assert_eq!(image_dimensions(&png_header(600, 800)), Some((600, 800)));
        assert_eq!(image_dimensions(&jpeg(3200, 100)), Some((3200, 100)));
        assert_eq!(image_dimensions(b"GIF89a\x10\x00\x20\x00rest"), Some((16, 32)));
        assert_eq!(image_dimensions(b"not an image"), None);
        assert_eq!(image_dimensions(&png_header(0, 10)), None);
    }

    #[test]
    fn test_clean_book_resources() {
        assert!(run(clean_book()).is_empty());
    }

    #[test]
    fn test_missing_cover() {
        let found = run(book(""));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "COVER_MISSING");
    }

    #[test]
    fn test_multiple_covers_is_error() {
        let found = run(book(
            r#"<item id="a" href="a.png" media-type="image/png" properties="cover-image"/>
    <item id="b" href="b.png" media-type="image/png" properties="cover-image"/>"#,
        )
        .stored("OEBPS/a.png", &png_header(600, 800))
        .stored("OEBPS/b.png", &png_header(600, 800)));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "COVER_MULTIPLE");
        assert_eq!(found[0].severity, crate::Severity::Error);
    }

    #[test]
    fn test_small_and_large_images() {
        let found = run(book(
            r#"<item id="cv" href="cv.png" media-type="image/png" properties="cover-image"/>
    <item id="big" href="big.jpg" media-type="image/jpeg"/>"#,
        )
        .stored("OEBPS/cv.png", &png_header(200, 300))
        .stored("OEBPS/big.jpg", &jpeg(4000, 5000)));
        let codes: Vec<&str> = found.iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["IMAGE_DIMENSIONS", "COVER_TOO_SMALL"]);
    }

    #[test]
    fn test_legacy_cover_meta_not_flagged() {
        let metadata = r#"<dc:title>T</dc:title><dc:identifier id="uid">x</dc:identifier>
    <dc:language>en</dc:language><meta name="cover" content="cv"/>"#;
        let manifest = r#"<item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="cv" href="cv.png" media-type="image/png"/>"#;
        let builder = ZipBuilder::epub(&crate::test_support::opf_with_metadata(
            "3.0",
            metadata,
            manifest,
            r#"<itemref idref="c1"/>"#,
        ))
        .deflated("OEBPS/ch1.xhtml", xhtml("<p/>").as_bytes())
        .stored("OEBPS/cv.png", &png_header(600, 800));
        let found = run(builder);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "COVER_NOT_FLAGGED");
    }

    #[test]
    fn test_fonts_media_and_properties() {
        let found = run(book(
            r#"<item id="cv" href="cv.png" media-type="image/png" properties="cover-image"/>
    <item id="f" href="f.woff" media-type="font/woff"/>
    <item id="v" href="v.mp4" media-type="video/mp4"/>
    <item id="m" href="m.xhtml" media-type="application/xhtml+xml" properties="mathml scripted"/>
    <item id="s" href="s.svg" media-type="image/svg+xml"/>"#,
        )
        .stored("OEBPS/cv.png", &png_header(600, 800))
        .stored("OEBPS/f.woff", b"wOFF")
        .stored("OEBPS/v.mp4", b"....")
        .deflated("OEBPS/m.xhtml", xhtml("<p/>").as_bytes())
        .deflated("OEBPS/s.svg", b"<svg/>"));
        let tagged: Vec<(&str, Platform)> = found.iter().map(|d| (d.code, d.platform)).collect();
        assert_eq!(
            tagged,
            vec![
                ("IMAGE_SVG", Platform::Eink),
                ("IMAGE_SVG", Platform::Kindle),
                ("FONT_WOFF", Platform::Kindle),
                ("FONT_WOFF", Platform::Eink),
                ("MEDIA_AUDIO_VIDEO", Platform::Kindle),
                ("MEDIA_AUDIO_VIDEO", Platform::Android),
                ("SCRIPTED_CONTENT", Platform::AppleBooks),
                ("MATHML_CONTENT", Platform::Eink),
                ("MATHML_CONTENT", Platform::Android),
            ]
        );
    }
}
