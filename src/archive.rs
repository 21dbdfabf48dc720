//! Secure archive reader
//!
//! [`Archive`] wraps [`ZipReader`] with the safety policy for untrusted
//! books:
//!
//! - every entry name is normalized once at open time; names that escape the
//!   archive root are refused and never become readable,
//! - declared sizes are screened against an absolute ceiling and an expansion
//!   ratio before a single byte is inflated,
//! - inflation output is capped at the declared size, so lying headers fail
//!   instead of exhausting memory,
//! - decompressed content is cached per logical path for the lifetime of the
//!   archive; the first fill wins.
//!
//! `Archive` is `Send + Sync`: checks borrow it immutably and may run on
//! several threads.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ArchiveError;
use crate::path::normalize_archive_path;
use crate::zip::{CdEntry, ZipReader, MAX_EOCD_SCAN, METHOD_DEFLATED};

/// Default absolute ceiling for one entry's uncompressed size (256 MiB).
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 256 * 1024 * 1024;
/// Default maximum uncompressed/compressed expansion ratio.
pub const DEFAULT_MAX_RATIO: u64 = 100;
/// Default size below which the ratio screen is skipped; zero screens every
/// DEFLATE entry.
pub const DEFAULT_RATIO_FLOOR: u64 = 0;
/// Default cap on central directory records.
pub const DEFAULT_MAX_ENTRIES: usize = u16::MAX as usize;

// Preallocation for reads is bounded independently of declared sizes.
const MAX_PREALLOC: u64 = 1024 * 1024;

/// Byte source an [`Archive`] can be opened over.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Runtime-configurable archive safety limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchiveLimits {
    /// Absolute ceiling for any entry's declared uncompressed size.
    pub max_entry_size: u64,
    /// Maximum declared uncompressed/compressed ratio for DEFLATE entries.
    pub max_ratio: u64,
    /// Declared uncompressed size below which the ratio screen is skipped.
    pub ratio_floor: u64,
    /// Maximum number of central directory records.
    pub max_entries: usize,
    /// Maximum bytes scanned from the file tail while searching for EOCD.
    pub max_eocd_scan: usize,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRY_SIZE, DEFAULT_MAX_RATIO)
    }
}

impl ArchiveLimits {
    /// Create explicit limits with default entry count and EOCD scan window.
    pub fn new(max_entry_size: u64, max_ratio: u64) -> Self {
        Self {
            max_entry_size,
            max_ratio: max_ratio.max(1),
            ratio_floor: DEFAULT_RATIO_FLOOR,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_eocd_scan: MAX_EOCD_SCAN,
        }
    }

    /// Set the absolute uncompressed-size ceiling.
    pub fn with_max_entry_size(mut self, max_entry_size: u64) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    /// Set the maximum expansion ratio.
    pub fn with_max_ratio(mut self, max_ratio: u64) -> Self {
        self.max_ratio = max_ratio.max(1);
        self
    }

    /// Exempt DEFLATE entries declaring less than `ratio_floor` bytes from
    /// the ratio screen.
    pub fn with_ratio_floor(mut self, ratio_floor: u64) -> Self {
        self.ratio_floor = ratio_floor;
        self
    }

    /// Set the central directory record cap.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set a cap for EOCD tail scan bytes.
    pub fn with_max_eocd_scan(mut self, max_eocd_scan: usize) -> Self {
        self.max_eocd_scan = max_eocd_scan;
        self
    }

    /// Screen an entry's declared sizes without touching its data.
    fn screen(&self, path: &str, cd: &CdEntry) -> Result<(), ArchiveError> {
        if cd.uncompressed_size > self.max_entry_size {
            return Err(ArchiveError::EntryTooLarge {
                path: path.to_string(),
                declared: cd.uncompressed_size,
                limit: self.max_entry_size,
            });
        }
        if cd.method == METHOD_DEFLATED && cd.uncompressed_size >= self.ratio_floor {
            let ratio = cd.uncompressed_size / cd.compressed_size.max(1);
            if ratio > self.max_ratio {
                return Err(ArchiveError::RatioExceeded {
                    path: path.to_string(),
                    ratio,
                    limit: self.max_ratio,
                });
            }
        }
        Ok(())
    }
}

/// Descriptor of one archive entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Normalized archive-relative path.
    pub path: String,
    /// Declared compressed size.
    pub compressed_size: u64,
    /// Declared uncompressed size.
    pub uncompressed_size: u64,
    /// ZIP compression method.
    pub method: u16,
    refusal: Option<ArchiveError>,
}

impl ArchiveEntry {
    /// Returns the reason this entry will never be materialized, if any.
    pub fn refusal(&self) -> Option<&ArchiveError> {
        self.refusal.as_ref()
    }
}

/// Facts about the physically first entry, used by the container checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirstEntry {
    /// Name exactly as stored.
    pub raw_name: String,
    /// ZIP compression method.
    pub method: u16,
    /// Length of the local header extra field.
    pub local_extra_len: u16,
}

/// A central directory record whose normalized path was already taken by an
/// earlier record. Only the first record is served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateEntry {
    /// Name exactly as stored in the shadowed record.
    pub raw_name: String,
    /// Logical path both records normalize to.
    pub path: String,
}

/// An opened, screened archive with an on-demand content cache.
pub struct Archive {
    zip: Mutex<ZipReader<Box<dyn ReadSeek>>>,
    entries: Vec<ArchiveEntry>,
    cd: Vec<CdEntry>,
    index: BTreeMap<String, usize>,
    refusals: Vec<ArchiveError>,
    duplicates: Vec<DuplicateEntry>,
    cache: Mutex<BTreeMap<String, Arc<[u8]>>>,
    first_entry: Option<FirstEntry>,
    byte_len: u64,
    limits: ArchiveLimits,
}

impl Archive {
    /// Open an archive from a filesystem path with default limits.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        Self::open_with_limits(path, ArchiveLimits::default())
    }

    /// Open an archive from a filesystem path.
    pub fn open_with_limits<P: AsRef<Path>>(
        path: P,
        limits: ArchiveLimits,
    ) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|e| ArchiveError::Io(e.to_string()))?;
        Self::from_reader(file, limits)
    }

    /// Open an archive held in memory.
    pub fn from_bytes(bytes: Vec<u8>, limits: ArchiveLimits) -> Result<Self, ArchiveError> {
        Self::from_reader(Cursor::new(bytes), limits)
    }

    /// Open an archive over any seekable reader.
    pub fn from_reader<R: ReadSeek + 'static>(
        reader: R,
        limits: ArchiveLimits,
    ) -> Result<Self, ArchiveError> {
        let boxed: Box<dyn ReadSeek> = Box::new(reader);
        let mut zip = ZipReader::open(boxed, limits.max_eocd_scan, limits.max_entries)?;

        let first_entry = match zip.first_physical_entry().cloned() {
            Some(first) => Some(FirstEntry {
                local_extra_len: zip.local_extra_len(&first)?,
                raw_name: first.filename,
                method: first.method,
            }),
            None => None,
        };

        let mut entries = Vec::new();
        let mut cd = Vec::new();
        let mut index = BTreeMap::new();
        let mut refusals = Vec::new();
        let mut duplicates = Vec::new();

        for raw in zip.entries() {
            if raw.is_dir() {
                continue;
            }
            let path = match normalize_archive_path(&raw.filename) {
                Ok(path) if !path.is_empty() => path,
                Ok(_) => continue,
                Err(err) => {
                    log::warn!("[ARCHIVE] Refusing entry '{}': {}", raw.filename, err);
                    refusals.push(err);
                    continue;
                }
            };
            if index.contains_key(&path) {
                log::warn!(
                    "[ARCHIVE] Entry '{}' duplicates '{}'; keeping the first",
                    raw.filename,
                    path
                );
                duplicates.push(DuplicateEntry {
                    raw_name: raw.filename.clone(),
                    path,
                });
                continue;
            }
            let refusal = limits.screen(&path, raw).err();
            if let Some(err) = &refusal {
                log::warn!("[ARCHIVE] Refusing entry: {}", err);
                refusals.push(err.clone());
            }
            index.insert(path.clone(), entries.len());
            entries.push(ArchiveEntry {
                path,
                compressed_size: raw.compressed_size,
                uncompressed_size: raw.uncompressed_size,
                method: raw.method,
                refusal,
            });
            cd.push(raw.clone());
        }

        let byte_len = zip.archive_len();
        Ok(Self {
            zip: Mutex::new(zip),
            entries,
            cd,
            index,
            refusals,
            duplicates,
            cache: Mutex::new(BTreeMap::new()),
            first_entry,
            byte_len,
            limits,
        })
    }

    /// Screened entries in central directory order. Escaping entries are
    /// not listed.
    pub fn list_entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Look up an entry by logical path.
    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        let logical = normalize_archive_path(path).ok()?;
        self.index.get(&logical).map(|&i| &self.entries[i])
    }

    /// Returns `true` if an entry with this logical path exists, whether or
    /// not it is readable.
    pub fn contains(&self, path: &str) -> bool {
        self.entry(path).is_some()
    }

    /// Case-insensitive lookup, for hints about near-miss references.
    pub fn find_case_insensitive(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.path.eq_ignore_ascii_case(path))
            .map(|e| e.path.as_str())
    }

    /// Returns `true` if the entry exists but was refused at open time.
    pub fn is_refused(&self, path: &str) -> bool {
        self.entry(path).is_some_and(|e| e.refusal.is_some())
    }

    /// Every refusal recorded while screening the central directory.
    pub fn refusals(&self) -> &[ArchiveError] {
        &self.refusals
    }

    /// Records shadowed by an earlier record with the same logical path.
    pub fn duplicates(&self) -> &[DuplicateEntry] {
        &self.duplicates
    }

    /// The physically first entry, if the archive has any.
    pub fn first_entry(&self) -> Option<&FirstEntry> {
        self.first_entry.as_ref()
    }

    /// Size of the archive file in bytes.
    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }

    /// Limits this archive was opened with.
    pub fn limits(&self) -> ArchiveLimits {
        self.limits
    }

    /// Read an entry's decompressed content.
    ///
    /// The requested path is normalized first. Content is decompressed at
    /// most once; later reads share the cached buffer.
    pub fn read(&self, path: &str) -> Result<Arc<[u8]>, ArchiveError> {
        let logical = normalize_archive_path(path)?;
        let &idx = self
            .index
            .get(&logical)
            .ok_or_else(|| ArchiveError::NotFound(logical.clone()))?;
        let entry = &self.entries[idx];
        if let Some(err) = &entry.refusal {
            return Err(err.clone());
        }
        if let Some(hit) = self.cache()?.get(&logical) {
            return Ok(Arc::clone(hit));
        }

        let cap = entry.uncompressed_size.min(self.limits.max_entry_size);
        let mut out = Vec::with_capacity(cap.min(MAX_PREALLOC) as usize);
        {
            let mut zip = self
                .zip
                .lock()
                .map_err(|_| ArchiveError::Io("archive reader lock poisoned".to_string()))?;
            zip.read_to_writer(&self.cd[idx], &mut out, cap)?;
        }
        log::debug!("[ARCHIVE] Cached '{}' ({} bytes)", logical, out.len());

        let bytes: Arc<[u8]> = out.into();
        let mut cache = self.cache()?;
        let stored = cache.entry(logical).or_insert(bytes);
        Ok(Arc::clone(stored))
    }

    /// Read an entry as text. Invalid UTF-8 is replaced and a leading BOM
    /// is dropped.
    pub fn read_text(&self, path: &str) -> Result<String, ArchiveError> {
        let bytes = self.read(path)?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(text.strip_prefix('\u{feff}').unwrap_or(&text).to_string())
    }

    fn cache(&self) -> Result<MutexGuard<'_, BTreeMap<String, Arc<[u8]>>>, ArchiveError> {
        self.cache
            .lock()
            .map_err(|_| ArchiveError::Io("archive cache lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("entries", &self.entries.len())
            .field("refusals", &self.refusals)
            .field("byte_len", &self.byte_len)
            .field("limits", &self.limits)
            .finish()
    }
}
