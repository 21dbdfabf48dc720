//! Central-directory ZIP reader
//!
//! Parses the end-of-central-directory record and the central directory
//! itself, then streams individual entries on request. Stored and DEFLATE
//! entries are supported; DEFLATE is inflated with miniz_oxide in fixed
//! chunks and every entry is CRC-checked with crc32fast.
//!
//! This layer knows nothing about EPUB or about safety policy. Size ceilings
//! and path checks live in [`crate::archive`], which only calls
//! [`ZipReader::read_to_writer`] after an entry passed them.

use miniz_oxide::{DataFormat, MZFlush, MZStatus};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::ArchiveError;

/// Local file header signature (little-endian)
const SIG_LOCAL_FILE_HEADER: u32 = 0x04034b50;

/// Central directory entry signature (little-endian)
const SIG_CD_ENTRY: u32 = 0x02014b50;

/// End of central directory signature (little-endian)
const SIG_EOCD: u32 = 0x06054b50;
/// ZIP64 end of central directory locator signature (little-endian)
const SIG_ZIP64_EOCD_LOCATOR: u32 = 0x07064b50;
/// Minimum EOCD record size in bytes
pub(crate) const EOCD_MIN_SIZE: usize = 22;
/// Maximum EOCD search window (EOCD + max comment length)
pub(crate) const MAX_EOCD_SCAN: usize = EOCD_MIN_SIZE + u16::MAX as usize;

/// Extra-field tag for ZIP64 extended information.
const EXTRA_ZIP64: u16 = 0x0001;

/// Compression methods
pub const METHOD_STORED: u16 = 0;
/// DEFLATE compression method.
pub const METHOD_DEFLATED: u16 = 8;

const CHUNK: usize = 8 * 1024;

#[derive(Clone, Copy, Debug)]
struct EocdInfo {
    cd_offset: u64,
    cd_size: u32,
    num_entries: u16,
    uses_zip64: bool,
}

/// Central directory entry metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdEntry {
    /// Compression method (0=stored, 8=deflated)
    pub method: u16,
    /// General purpose bit flags
    pub flags: u16,
    /// Declared compressed size in bytes
    pub compressed_size: u64,
    /// Declared uncompressed size in bytes
    pub uncompressed_size: u64,
    /// Offset to local file header
    pub local_header_offset: u64,
    /// CRC32 checksum
    pub crc32: u32,
    /// Raw entry name as stored in the archive
    pub filename: String,
}

impl CdEntry {
    /// Returns `true` if the entry is flagged as encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.flags & 0x0001 != 0
    }

    /// Returns `true` for directory placeholders (`name/`).
    pub fn is_dir(&self) -> bool {
        self.filename.ends_with('/')
    }
}

/// ZIP reader over any seekable byte source.
pub struct ZipReader<F: Read + Seek> {
    file: F,
    entries: Vec<CdEntry>,
    archive_len: u64,
}

impl<F: Read + Seek> ZipReader<F> {
    /// Open a ZIP source and parse its central directory.
    ///
    /// `max_eocd_scan` bounds the tail scan for the EOCD record and
    /// `max_entries` bounds how many central directory records are accepted.
    pub fn open(mut file: F, max_eocd_scan: usize, max_entries: usize) -> Result<Self, ArchiveError> {
        let archive_len = file.seek(SeekFrom::End(0)).map_err(io_err)?;
        let eocd = Self::find_eocd(&mut file, archive_len, max_eocd_scan.min(MAX_EOCD_SCAN))?;
        if eocd.uses_zip64 {
            return Err(ArchiveError::UnsupportedZip64);
        }
        if eocd.num_entries as usize > max_entries {
            return Err(ArchiveError::CorruptArchive(format!(
                "central directory declares {} entries (limit {})",
                eocd.num_entries, max_entries
            )));
        }

        file.seek(SeekFrom::Start(eocd.cd_offset)).map_err(io_err)?;
        let cd_end = eocd.cd_offset + eocd.cd_size as u64;
        let mut entries = Vec::with_capacity(eocd.num_entries as usize);

        for index in 0..eocd.num_entries {
            let pos = file.stream_position().map_err(io_err)?;
            if pos >= cd_end {
                return Err(ArchiveError::CorruptArchive(format!(
                    "central directory ends after {} of {} entries",
                    index, eocd.num_entries
                )));
            }
            entries.push(Self::read_cd_entry(&mut file)?);
        }

        log::debug!(
            "[ZIP] Parsed {} central directory entries (offset {}, archive {} bytes)",
            entries.len(),
            eocd.cd_offset,
            archive_len
        );

        Ok(Self {
            file,
            entries,
            archive_len,
        })
    }

    /// Find EOCD and extract central directory info
    fn find_eocd(file: &mut F, file_size: u64, max_eocd_scan: usize) -> Result<EocdInfo, ArchiveError> {
        if file_size < EOCD_MIN_SIZE as u64 {
            return Err(ArchiveError::CorruptArchive(
                "file is too small to be a ZIP archive".to_string(),
            ));
        }

        let scan_range = file_size.min(max_eocd_scan as u64) as usize;
        let mut buffer = vec![0u8; scan_range];
        file.seek(SeekFrom::Start(file_size - scan_range as u64))
            .map_err(io_err)?;
        file.read_exact(&mut buffer).map_err(io_err)?;
        let scan_base = file_size - scan_range as u64;

        // Scan backwards for EOCD signature
        for i in (0..=scan_range.saturating_sub(EOCD_MIN_SIZE)).rev() {
            if read_u32_le(&buffer, i) != SIG_EOCD {
                continue;
            }
            let num_entries = read_u16_le(&buffer, i + 10);
            let cd_size = read_u32_le(&buffer, i + 12);
            let cd_offset = read_u32_le(&buffer, i + 16) as u64;
            let comment_len = read_u16_le(&buffer, i + 20) as u64;
            let eocd_pos = scan_base + i as u64;
            if eocd_pos + EOCD_MIN_SIZE as u64 + comment_len != file_size {
                continue;
            }

            let uses_zip64_sentinel =
                num_entries == u16::MAX || cd_size == u32::MAX || cd_offset == u32::MAX as u64;
            let uses_zip64_locator = eocd_pos >= 20 && {
                file.seek(SeekFrom::Start(eocd_pos - 20)).map_err(io_err)?;
                let mut locator_sig = [0u8; 4];
                file.read_exact(&mut locator_sig).map_err(io_err)?;
                u32::from_le_bytes(locator_sig) == SIG_ZIP64_EOCD_LOCATOR
            };
            if uses_zip64_sentinel || uses_zip64_locator {
                return Ok(EocdInfo {
                    cd_offset,
                    cd_size,
                    num_entries,
                    uses_zip64: true,
                });
            }

            let cd_end = cd_offset + cd_size as u64;
            if cd_end > eocd_pos {
                return Err(ArchiveError::CorruptArchive(
                    "central directory overlaps end record".to_string(),
                ));
            }

            return Ok(EocdInfo {
                cd_offset,
                cd_size,
                num_entries,
                uses_zip64: false,
            });
        }

        Err(ArchiveError::CorruptArchive(
            "end of central directory record not found".to_string(),
        ))
    }

    /// Read one central directory record at the current position.
    fn read_cd_entry(file: &mut F) -> Result<CdEntry, ArchiveError> {
        let mut sig_buf = [0u8; 4];
        file.read_exact(&mut sig_buf).map_err(io_err)?;
        if u32::from_le_bytes(sig_buf) != SIG_CD_ENTRY {
            return Err(ArchiveError::CorruptArchive(
                "bad central directory signature".to_string(),
            ));
        }

        // Fixed portion after the signature; buf[N] is CD offset N + 4.
        let mut buf = [0u8; 42];
        file.read_exact(&mut buf).map_err(io_err)?;

        let flags = read_u16_le(&buf, 4);
        let method = read_u16_le(&buf, 6);
        let crc32 = read_u32_le(&buf, 12);
        let compressed32 = read_u32_le(&buf, 16);
        let uncompressed32 = read_u32_le(&buf, 20);
        let name_len = read_u16_le(&buf, 24) as usize;
        let extra_len = read_u16_le(&buf, 26) as usize;
        let comment_len = read_u16_le(&buf, 28) as usize;
        let offset32 = read_u32_le(&buf, 38);

        let mut name_buf = vec![0u8; name_len];
        file.read_exact(&mut name_buf).map_err(io_err)?;
        let mut extra = vec![0u8; extra_len];
        file.read_exact(&mut extra).map_err(io_err)?;
        if comment_len > 0 {
            file.seek(SeekFrom::Current(comment_len as i64))
                .map_err(io_err)?;
        }

        let mut entry = CdEntry {
            method,
            flags,
            compressed_size: compressed32 as u64,
            uncompressed_size: uncompressed32 as u64,
            local_header_offset: offset32 as u64,
            crc32,
            filename: String::from_utf8_lossy(&name_buf).into_owned(),
        };
        apply_zip64_extra(&mut entry, &extra, uncompressed32, compressed32, offset32);
        Ok(entry)
    }

    /// All central directory entries in directory order.
    pub fn entries(&self) -> &[CdEntry] {
        &self.entries
    }

    /// Total size of the underlying source in bytes.
    pub fn archive_len(&self) -> u64 {
        self.archive_len
    }

    /// The entry whose local header comes first in the file.
    pub fn first_physical_entry(&self) -> Option<&CdEntry> {
        self.entries.iter().min_by_key(|e| e.local_header_offset)
    }

    /// Length of the local header's extra field for `entry`.
    pub fn local_extra_len(&mut self, entry: &CdEntry) -> Result<u16, ArchiveError> {
        let header = self.read_local_header(entry)?;
        Ok(read_u16_le(&header, 28))
    }

    /// Stream an entry's decompressed bytes into `writer`.
    ///
    /// Fails with [`ArchiveError::DecompressError`] as soon as more than
    /// `output_cap` bytes would be produced, so a lying size field can never
    /// make this allocate past the cap.
    pub fn read_to_writer<W: Write>(
        &mut self,
        entry: &CdEntry,
        writer: &mut W,
        output_cap: u64,
    ) -> Result<u64, ArchiveError> {
        if entry.is_encrypted() {
            return Err(ArchiveError::DecompressError(entry.filename.clone()));
        }
        let data_offset = self.calc_data_offset(entry)?;
        self.file
            .seek(SeekFrom::Start(data_offset))
            .map_err(io_err)?;

        let mut input_buf = vec![0u8; CHUNK];
        let mut hasher = crc32fast::Hasher::new();
        let mut written = 0u64;

        match entry.method {
            METHOD_STORED => {
                if entry.compressed_size > output_cap {
                    return Err(ArchiveError::DecompressError(entry.filename.clone()));
                }
                let mut remaining = entry.compressed_size;
                while remaining > 0 {
                    let take = remaining.min(CHUNK as u64) as usize;
                    self.file
                        .read_exact(&mut input_buf[..take])
                        .map_err(io_err)?;
                    writer.write_all(&input_buf[..take]).map_err(io_err)?;
                    hasher.update(&input_buf[..take]);
                    written += take as u64;
                    remaining -= take as u64;
                }
            }
            METHOD_DEFLATED => {
                let mut output_buf = vec![0u8; CHUNK];
                let mut state = Box::new(miniz_oxide::inflate::stream::InflateState::new(
                    DataFormat::Raw,
                ));
                let mut compressed_remaining = entry.compressed_size;
                let mut pending_start = 0usize;
                let mut pending_end = 0usize;

                loop {
                    if pending_start == pending_end && compressed_remaining > 0 {
                        let take = compressed_remaining.min(CHUNK as u64) as usize;
                        self.file
                            .read_exact(&mut input_buf[..take])
                            .map_err(io_err)?;
                        pending_start = 0;
                        pending_end = take;
                        compressed_remaining -= take as u64;
                    }

                    let flush = if compressed_remaining == 0 {
                        MZFlush::Finish
                    } else {
                        MZFlush::None
                    };
                    let result = miniz_oxide::inflate::stream::inflate(
                        &mut state,
                        &input_buf[pending_start..pending_end],
                        &mut output_buf,
                        flush,
                    );
                    let consumed = result.bytes_consumed;
                    let produced = result.bytes_written;
                    pending_start += consumed;

                    if produced > 0 {
                        if written + produced as u64 > output_cap {
                            return Err(ArchiveError::DecompressError(entry.filename.clone()));
                        }
                        writer.write_all(&output_buf[..produced]).map_err(io_err)?;
                        hasher.update(&output_buf[..produced]);
                        written += produced as u64;
                    }

                    match result.status {
                        Ok(MZStatus::StreamEnd) => {
                            if compressed_remaining != 0 || pending_start != pending_end {
                                return Err(ArchiveError::DecompressError(
                                    entry.filename.clone(),
                                ));
                            }
                            break;
                        }
                        Ok(MZStatus::Ok) => {
                            if consumed == 0 && produced == 0 {
                                return Err(ArchiveError::DecompressError(
                                    entry.filename.clone(),
                                ));
                            }
                        }
                        Ok(MZStatus::NeedDict) | Err(_) => {
                            return Err(ArchiveError::DecompressError(entry.filename.clone()));
                        }
                    }
                }
            }
            other => return Err(ArchiveError::UnsupportedCompression(other)),
        }

        if hasher.finalize() != entry.crc32 {
            return Err(ArchiveError::CrcMismatch(entry.filename.clone()));
        }
        Ok(written)
    }

    fn read_local_header(&mut self, entry: &CdEntry) -> Result<[u8; 30], ArchiveError> {
        self.file
            .seek(SeekFrom::Start(entry.local_header_offset))
            .map_err(io_err)?;
        let mut header = [0u8; 30];
        self.file.read_exact(&mut header).map_err(io_err)?;
        if read_u32_le(&header, 0) != SIG_LOCAL_FILE_HEADER {
            return Err(ArchiveError::CorruptArchive(format!(
                "bad local header for '{}'",
                entry.filename
            )));
        }
        Ok(header)
    }

    /// Calculate the offset to the actual file data (past local header)
    fn calc_data_offset(&mut self, entry: &CdEntry) -> Result<u64, ArchiveError> {
        let header = self.read_local_header(entry)?;
        let name_len = read_u16_le(&header, 26) as u64;
        let extra_len = read_u16_le(&header, 28) as u64;
        Ok(entry.local_header_offset + 30 + name_len + extra_len)
    }
}

/// Replace saturated 32-bit fields with values from a ZIP64 extra block.
///
/// Only fields whose 32-bit value is `0xFFFFFFFF` appear in the block, in the
/// fixed order uncompressed, compressed, local header offset.
fn apply_zip64_extra(
    entry: &mut CdEntry,
    extra: &[u8],
    uncompressed32: u32,
    compressed32: u32,
    offset32: u32,
) {
    let mut pos = 0usize;
    while pos + 4 <= extra.len() {
        let tag = read_u16_le(extra, pos);
        let size = read_u16_le(extra, pos + 2) as usize;
        let body_start = pos + 4;
        let body_end = (body_start + size).min(extra.len());
        if tag == EXTRA_ZIP64 {
            let body = &extra[body_start..body_end];
            let mut cursor = 0usize;
            let mut next = || {
                let value = body
                    .get(cursor..cursor + 8)
                    .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]));
                cursor += 8;
                value
            };
            if uncompressed32 == u32::MAX {
                if let Some(v) = next() {
                    entry.uncompressed_size = v;
                }
            }
            if compressed32 == u32::MAX {
                if let Some(v) = next() {
                    entry.compressed_size = v;
                }
            }
            if offset32 == u32::MAX {
                if let Some(v) = next() {
                    entry.local_header_offset = v;
                }
            }
            return;
        }
        pos = body_start + size;
    }
}

fn io_err(err: std::io::Error) -> ArchiveError {
    ArchiveError::Io(err.to_string())
}

/// Read u16 from buffer at offset (little-endian)
fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Read u32 from buffer at offset (little-endian)
fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
