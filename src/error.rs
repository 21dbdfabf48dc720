//! Unified error types for mu-epub-lint
//!
//! Errors here never reach the caller of a validation run directly: every
//! failure is converted into a diagnostic so a report is always produced.
//! They are public because the archive and model layers are usable on
//! their own.

use std::fmt;

/// Archive-level failures raised by the secure archive reader.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ArchiveError {
    /// The container is not a readable ZIP archive.
    CorruptArchive(String),
    /// An entry name normalizes to a location outside the archive root.
    PathEscape(String),
    /// Declared uncompressed size exceeds the absolute ceiling.
    EntryTooLarge {
        /// Logical path of the refused entry.
        path: String,
        /// Declared uncompressed size in bytes.
        declared: u64,
        /// Configured ceiling in bytes.
        limit: u64,
    },
    /// Declared expansion ratio exceeds the configured maximum.
    RatioExceeded {
        /// Logical path of the refused entry.
        path: String,
        /// Declared uncompressed/compressed ratio.
        ratio: u64,
        /// Configured maximum ratio.
        limit: u64,
    },
    /// No entry with this logical path exists.
    NotFound(String),
    /// Unsupported compression method
    UnsupportedCompression(u16),
    /// Decompression failed or produced more data than declared
    DecompressError(String),
    /// CRC32 mismatch
    CrcMismatch(String),
    /// ZIP64 end-of-central-directory structures are not supported
    UnsupportedZip64,
    /// I/O error (description only, since `std::io::Error` is not `Clone`)
    Io(String),
}

impl ArchiveError {
    /// Returns `true` for the decompression-bomb refusals.
    pub fn is_size_refusal(&self) -> bool {
        matches!(
            self,
            ArchiveError::EntryTooLarge { .. } | ArchiveError::RatioExceeded { .. }
        )
    }
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::CorruptArchive(msg) => write!(f, "corrupt archive: {}", msg),
            ArchiveError::PathEscape(path) => {
                write!(f, "entry '{}' resolves outside the archive root", path)
            }
            ArchiveError::EntryTooLarge {
                path,
                declared,
                limit,
            } => write!(
                f,
                "entry '{}' declares {} bytes uncompressed (limit {})",
                path, declared, limit
            ),
            ArchiveError::RatioExceeded { path, ratio, limit } => write!(
                f,
                "entry '{}' declares a {}:1 expansion ratio (limit {}:1)",
                path, ratio, limit
            ),
            ArchiveError::NotFound(path) => write!(f, "'{}' not found in archive", path),
            ArchiveError::UnsupportedCompression(method) => {
                write!(f, "unsupported compression method {}", method)
            }
            ArchiveError::DecompressError(path) => write!(f, "decompression of '{}' failed", path),
            ArchiveError::CrcMismatch(path) => write!(f, "CRC32 checksum mismatch in '{}'", path),
            ArchiveError::UnsupportedZip64 => write!(f, "ZIP64 is not supported"),
            ArchiveError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ArchiveError {}

/// Failures that prevent the package model from being built.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelError {
    /// `META-INF/container.xml` is absent or declares no rootfile.
    MissingContainerPointer(String),
    /// The rootfile named by the container pointer does not exist.
    MissingPackageDocument(String),
    /// The container pointer or package document is not well-formed XML.
    MalformedXml {
        /// Archive path of the failing document.
        path: String,
        /// Parser message.
        message: String,
    },
    /// The archive refused to hand out a required document.
    Archive(ArchiveError),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::MissingContainerPointer(msg) => {
                write!(f, "missing container pointer: {}", msg)
            }
            ModelError::MissingPackageDocument(path) => {
                write!(f, "package document '{}' is missing", path)
            }
            ModelError::MalformedXml { path, message } => {
                write!(f, "malformed XML in '{}': {}", path, message)
            }
            ModelError::Archive(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<ArchiveError> for ModelError {
    fn from(err: ArchiveError) -> Self {
        ModelError::Archive(err)
    }
}

/// A single content rule could not be evaluated on a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleError {
    /// Code of the rule that failed.
    pub rule: &'static str,
    /// Archive path of the document.
    pub path: String,
    /// Underlying reason.
    pub reason: String,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not evaluate rule {} on '{}': {}",
            self.rule, self.path, self.reason
        )
    }
}

impl std::error::Error for RuleError {}

/// Top-level error type for mu-epub-lint operations
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EpubLintError {
    /// Archive error
    Archive(ArchiveError),
    /// Package model error
    Model(ModelError),
    /// Rule evaluation error
    Rule(RuleError),
    /// XML/XHTML parsing error outside the package document
    Parse(String),
}

impl fmt::Display for EpubLintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpubLintError::Archive(err) => write!(f, "archive error: {}", err),
            EpubLintError::Model(err) => write!(f, "package error: {}", err),
            EpubLintError::Rule(err) => write!(f, "rule error: {}", err),
            EpubLintError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for EpubLintError {}

impl From<ArchiveError> for EpubLintError {
    fn from(err: ArchiveError) -> Self {
        EpubLintError::Archive(err)
    }
}

impl From<ModelError> for EpubLintError {
    fn from(err: ModelError) -> Self {
        EpubLintError::Model(err)
    }
}

impl From<RuleError> for EpubLintError {
    fn from(err: RuleError) -> Self {
        EpubLintError::Rule(err)
    }
}
