//! Container-level checks: the `mimetype` entry, `META-INF` side files,
//! refused entries and overall archive size. None of these need the
//! package model, so they still run when it could not be built.

use quick_xml::events::Event;

use crate::archive::Archive;
use crate::check::{Check, CheckContext};
use crate::diagnostic::{Diagnostic, Platform};
use crate::error::{ArchiveError, EpubLintError};
use crate::markup::check_well_formed;
use crate::path::resolve_relative;
use crate::xml::{get_attribute, local_name, reader};
use crate::zip::METHOD_STORED;

const MIMETYPE_PATH: &str = "mimetype";
const EPUB_MIMETYPE: &[u8] = b"application/epub+zip";
const ENCRYPTION_PATH: &str = "META-INF/encryption.xml";
const RIGHTS_PATH: &str = "META-INF/rights.xml";
const SPEC_MIMETYPE: &str = "EPUB OCF 3.0 § 3.3";
const SPEC_PATHS: &str = "EPUB OCF 3.0 § 3.2";

/// Font obfuscation algorithms; these do not restrict reading.
const FONT_OBFUSCATION: [&str; 2] = [
    "http://www.idpf.org/2008/embedding",
    "http://ns.adobe.com/pdf/enc#RC",
];

/// What `META-INF/encryption.xml` declares.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptionInfo {
    /// `EncryptionMethod@Algorithm` values in document order
    pub algorithms: Vec<String>,
    /// `CipherReference@URI` values in document order
    pub references: Vec<String>,
}

impl EncryptionInfo {
    /// Returns `true` if every declared algorithm is font obfuscation.
    pub fn is_font_obfuscation_only(&self) -> bool {
        !self.algorithms.is_empty()
            && self
                .algorithms
                .iter()
                .all(|a| FONT_OBFUSCATION.contains(&a.as_str()))
    }
}

/// Parse `META-INF/encryption.xml`.
pub fn parse_encryption_xml(content: &[u8]) -> Result<EncryptionInfo, EpubLintError> {
    let text = String::from_utf8_lossy(content);
    if let Some(fault) = check_well_formed(&text) {
        return Err(EpubLintError::Parse(format!(
            "line {}: {}",
            fault.line, fault.message
        )));
    }

    let mut reader = reader(content);
    let mut buf = Vec::new();
    let mut info = EncryptionInfo::default();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                match local_name(e.name().as_ref(), &reader).as_str() {
                    "EncryptionMethod" => {
                        if let Some(algorithm) = get_attribute(&e, &reader, "Algorithm") {
                            info.algorithms.push(algorithm);
                        }
                    }
                    "CipherReference" => {
                        if let Some(uri) = get_attribute(&e, &reader, "URI") {
                            info.references.push(uri);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(EpubLintError::Parse(format!("encryption.xml: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(info)
}

/// Container structure checks.
pub struct ContainerRules;

impl ContainerRules {
    fn mimetype(archive: &Archive, out: &mut Vec<Diagnostic>) {
        if !archive.contains(MIMETYPE_PATH) {
            out.push(
                Diagnostic::error("OCF_MIMETYPE_MISSING", "Missing 'mimetype' file.")
                    .spec(SPEC_MIMETYPE)
                    .hint("Most readers refuse to open the book without it."),
            );
            return;
        }

        if let Some(first) = archive.first_entry() {
            if first.raw_name != MIMETYPE_PATH {
                out.push(
                    Diagnostic::error(
                        "MIMETYPE_NOT_FIRST",
                        format!(
                            "'mimetype' must be the first file in the archive (found '{}').",
                            first.raw_name
                        ),
                    )
                    .at(MIMETYPE_PATH)
                    .spec(SPEC_MIMETYPE),
                );
            } else {
                if first.method != METHOD_STORED {
                    out.push(
                        Diagnostic::error(
                            "OCF_MIMETYPE_COMPRESSED",
                            "'mimetype' must be stored without compression.",
                        )
                        .at(MIMETYPE_PATH)
                        .spec(SPEC_MIMETYPE),
                    );
                }
                if first.local_extra_len != 0 {
                    out.push(
                        Diagnostic::warning(
                            "OCF_MIMETYPE_EXTRA_FIELD",
                            format!(
                                "'mimetype' local header carries a {}-byte extra field.",
                                first.local_extra_len
                            ),
                        )
                        .at(MIMETYPE_PATH)
                        .spec(SPEC_MIMETYPE),
                    );
                }
            }
        }

        match archive.read(MIMETYPE_PATH) {
            Ok(bytes) if bytes.as_ref() == EPUB_MIMETYPE => {}
            Ok(bytes) => out.push(
                Diagnostic::error(
                    "OCF_INVALID_MIMETYPE",
                    format!(
                        "'mimetype' contains '{}', expected 'application/epub+zip'.",
                        String::from_utf8_lossy(&bytes).escape_debug()
                    ),
                )
                .at(MIMETYPE_PATH)
                .spec(SPEC_MIMETYPE),
            ),
            Err(err) => out.push(
                Diagnostic::error(
                    "OCF_INVALID_MIMETYPE",
                    format!("'mimetype' could not be read: {}", err),
                )
                .at(MIMETYPE_PATH)
                .spec(SPEC_MIMETYPE),
            ),
        }
    }

    fn encryption(archive: &Archive, out: &mut Vec<Diagnostic>) {
        if !archive.contains(ENCRYPTION_PATH) {
            return;
        }
        let info = match archive
            .read(ENCRYPTION_PATH)
            .map_err(EpubLintError::from)
            .and_then(|bytes| parse_encryption_xml(&bytes))
        {
            Ok(info) => info,
            Err(err) => {
                out.push(
                    Diagnostic::error(
                        "ENCRYPTION_XML_PARSE_ERROR",
                        format!("Could not parse encryption.xml: {}", err),
                    )
                    .at(ENCRYPTION_PATH),
                );
                return;
            }
        };

        if info.is_font_obfuscation_only() {
            out.push(
                Diagnostic::info(
                    "ENCRYPTION_FONT_OBFUSCATION",
                    "Embedded fonts are obfuscated; readers without support fall back to default fonts.",
                )
                .at(ENCRYPTION_PATH),
            );
        } else {
            out.push(
                Diagnostic::error(
                    "ENCRYPTION_PRESENT",
                    "Book contains encrypted resources (DRM); many devices cannot open it.",
                )
                .at(ENCRYPTION_PATH)
                .hint("Distribute a DRM-free file or rely on the store's own protection."),
            );
        }

        for uri in &info.references {
            let target = resolve_relative("", uri);
            if !target.as_deref().is_some_and(|t| archive.contains(t)) {
                out.push(
                    Diagnostic::error(
                        "ENCRYPTION_REFERENCE_MISSING",
                        format!("encryption.xml references missing resource '{}'.", uri),
                    )
                    .at(ENCRYPTION_PATH),
                );
            }
        }
    }

    fn rights(archive: &Archive, out: &mut Vec<Diagnostic>) {
        if !archive.contains(RIGHTS_PATH) {
            return;
        }
        let fault = match archive.read_text(RIGHTS_PATH) {
            Ok(text) => check_well_formed(&text).map(|f| format!("line {}: {}", f.line, f.message)),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = fault {
            out.push(
                Diagnostic::error(
                    "RIGHTS_XML_PARSE_ERROR",
                    format!("Could not parse rights.xml: {}", reason),
                )
                .at(RIGHTS_PATH),
            );
        }
    }

    fn refusals(archive: &Archive, out: &mut Vec<Diagnostic>) {
        for refusal in archive.refusals() {
            let d = match refusal {
                ArchiveError::PathEscape(path) => Diagnostic::error(
                    "ARCHIVE_PATH_ESCAPE",
                    format!("Entry '{}' resolves outside the archive and was not extracted.", path),
                )
                .spec(SPEC_PATHS),
                ArchiveError::EntryTooLarge { path, .. } | ArchiveError::RatioExceeded { path, .. } => {
                    Diagnostic::error(
                        "ARCHIVE_ENTRY_REFUSED",
                        format!("Refused to decompress suspicious entry: {}", refusal),
                    )
                    .at(path)
                    .hint("Entries with absurd sizes or expansion ratios are decompression bombs.")
                }
                other => Diagnostic::error("ARCHIVE_ENTRY_REFUSED", other.to_string()),
            };
            out.push(d);
        }
        for dup in archive.duplicates() {
            out.push(
                Diagnostic::warning(
                    "ARCHIVE_DUPLICATE_ENTRY",
                    format!(
                        "Entry '{}' duplicates '{}'; only the first copy is read.",
                        dup.raw_name, dup.path
                    ),
                )
                .at(&dup.path)
                .spec(SPEC_PATHS)
                .hint("Readers disagree on which copy wins; keep one entry per path."),
            );
        }
    }

    fn size(ctx: &CheckContext<'_>, out: &mut Vec<Diagnostic>) {
        let bytes = ctx.archive.byte_len();
        let t = &ctx.options.thresholds;
        let mib = |n: u64| n as f64 / (1024.0 * 1024.0);
        if bytes > t.archive_warn_bytes {
            out.push(Diagnostic::warning(
                "ARCHIVE_LARGE",
                format!(
                    "Archive is {:.1} MB (above {:.0} MB); slow to load on many devices.",
                    mib(bytes),
                    mib(t.archive_warn_bytes)
                ),
            ));
        }
        if bytes > t.archive_kindle_bytes {
            out.push(
                Diagnostic::error(
                    "ARCHIVE_TOO_LARGE_KINDLE",
                    format!(
                        "Archive is {:.1} MB, above the {:.0} MB Kindle delivery limit.",
                        mib(bytes),
                        mib(t.archive_kindle_bytes)
                    ),
                )
                .on(Platform::Kindle),
            );
        }
    }
}

impl Check for ContainerRules {
    fn name(&self) -> &'static str {
        "container"
    }

    fn run(&self, ctx: &CheckContext<'_>) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        Self::mimetype(ctx.archive, &mut out);
        Self::encryption(ctx.archive, &mut out);
        Self::rights(ctx.archive, &mut out);
        Self::refusals(ctx.archive, &mut out);
        Self::size(ctx, &mut out);
        out
    }
}
