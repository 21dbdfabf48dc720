//! Optional async entry point.
//!
//! This module is available with the `async` feature.

use std::path::Path;

use crate::error::ArchiveError;
use crate::report::Report;
use crate::validate::{unreadable_report, validate_epub_bytes, ValidationOptions};

/// Read an EPUB file asynchronously and validate it.
///
/// The file is read into memory with `tokio::fs`; validation itself runs
/// synchronously on the calling task.
pub async fn validate_epub_file_async<P: AsRef<Path>>(path: P) -> Report {
    validate_epub_file_async_with_options(path, ValidationOptions::default()).await
}

/// Read an EPUB file asynchronously and validate it with options.
pub async fn validate_epub_file_async_with_options<P: AsRef<Path>>(
    path: P,
    options: ValidationOptions,
) -> Report {
    match tokio::fs::read(path).await {
        Ok(bytes) => validate_epub_bytes(bytes, options),
        Err(e) => unreadable_report(ArchiveError::Io(e.to_string())),
    }
}
