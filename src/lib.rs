//! mu-epub-lint -- Platform-aware EPUB compatibility validator
//!
//! Statically predicts how an EPUB will fare on a fixed set of reading
//! platforms (desktop readers, Apple Books, Kobo, e-ink readers, Kindle and
//! Android apps) and reports every deviation with a location, severity,
//! affected platform, spec reference and remediation hint.
//!
//! A run is a pure function from archive bytes to a [`Report`]:
//!
//! 1. [`archive`] opens the ZIP with path-safety and decompression-bomb
//!    screening and serves cached entry content.
//! 2. [`package`] builds the package model (container, OPF, spine,
//!    navigation).
//! 3. [`consistency`], [`rules`], [`resources`] and [`ocf`] run as
//!    independent [`check::Check`] values.
//! 4. [`report`] deduplicates, buckets and promotes the findings.
//!
//! # Features
//!
//! - `parallel` -- run checks and per-document work on the rayon pool
//! - `async` -- [`validate_epub_file_async`] reading through `tokio::fs`
//! - `cli` -- the `mu-epub-lint` binary

#![warn(missing_docs)]
#![deny(clippy::large_enum_variant, clippy::large_stack_arrays, clippy::redundant_clone)]
#![warn(
    clippy::box_collection,
    clippy::needless_collect,
    clippy::map_clone,
    clippy::implicit_clone,
    clippy::inefficient_to_string
)]

pub mod archive;
pub mod check;
pub mod consistency;
pub mod css;
pub mod diagnostic;
pub mod error;
pub mod markup;
pub mod metadata;
pub mod navigation;
pub mod ocf;
pub mod package;
pub mod path;
pub mod report;
pub mod resources;
pub mod rules;
pub mod spine;
pub mod validate;
pub mod zip;

#[cfg(feature = "async")]
pub mod async_api;

mod xml;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use archive::{Archive, ArchiveEntry, ArchiveLimits, DuplicateEntry};
#[cfg(feature = "async")]
pub use async_api::{validate_epub_file_async, validate_epub_file_async_with_options};
pub use check::{Check, CheckContext};
pub use diagnostic::{Diagnostic, Location, Platform, PlatformSet, Severity};
pub use error::{ArchiveError, EpubLintError, ModelError, RuleError};
pub use metadata::{ManifestItem, PackageMetadata};
pub use navigation::{Navigation, NavigationModel};
pub use package::{Generation, PackageModel};
pub use report::{Counts, CriticalGroup, CriticalIssue, ExitStatus, Report};
pub use rules::{ContentRule, ContentRules, RuleThresholds};
pub use spine::Spine;
pub use validate::{
    validate_epub_bytes, validate_epub_file, validate_epub_file_with_options,
    validate_epub_reader, validate_epub_reader_with_options, ValidationOptions, Validator,
};
