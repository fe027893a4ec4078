//! ZIP codec for the `lazy-zip` remote reader.
//!
//! This crate is the "given bytes, return a range or a decoded buffer" half
//! of the system: it never performs IO. The remote reader feeds it the
//! archive trailer, the central directory, and raw per-entry byte spans; it
//! answers with layout information and decoded payloads.
//!
//! Supported subset:
//! - single-disk, non-ZIP64 archives,
//! - stored and deflated entries,
//! - UTF-8 entry names, with a SHIFT_JIS fallback when the name flag is
//!   unset (common for archives produced by Japanese tooling).
//!
//! All operations are deterministic for identical byte inputs.

mod record;

pub use crate::record::{CentralEntry, Eocd};

use crate::record::{self as rec, COMPRESSION_DEFLATED, COMPRESSION_STORED};

use std::io::Read;

/// Result type used by this crate.
pub type FormatResult<T> = Result<T, FormatError>;

/// Codec-level failures.
///
/// The enum is `Clone` on purpose: the reader fans outcomes out to several
/// concurrent callers through shared futures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// Fewer bytes than the smallest possible record.
    #[error("data too short for a ZIP trailer")]
    TooShort,

    /// A required record signature was not found where expected.
    #[error("{0} signature not found")]
    MissingSignature(&'static str),

    /// Multi-disk archives are not supported.
    #[error("split archives are not supported")]
    DiskSplitUnsupported,

    /// ZIP64 archives are not supported.
    #[error("ZIP64 archives are not supported")]
    Zip64Unsupported,

    /// Entry name is neither valid UTF-8 nor valid SHIFT_JIS.
    #[error("entry name could not be decoded")]
    NameEncoding,

    /// No central-directory entry with this name.
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// Local header disagrees with the central-directory record.
    #[error("local header does not match central directory for {0}")]
    HeaderMismatch(String),

    /// Entry is encrypted.
    #[error("entry is encrypted: {0}")]
    Encrypted(String),

    /// Central directory places an entry at or past the directory itself.
    #[error("entry offset out of bounds: {0}")]
    BadLayout(String),

    /// Compression method this codec cannot decode.
    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u16),

    /// A record claimed more bytes than the buffer holds.
    #[error("record truncated")]
    Truncated,

    /// Deflate stream failed to decode.
    #[error("deflate decode failed: {0}")]
    Inflate(String),
}

impl From<std::io::Error> for FormatError {
    fn from(_: std::io::Error) -> Self {
        FormatError::Truncated
    }
}

/// A byte span inside the remote archive.
///
/// `size` follows the original layout math: an entry's span covers
/// `offset ..= offset + size`, i.e. everything up to (but excluding) the
/// next local header or the central directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub size: u64,
}

/// Parsed archive layout: the end-of-central-directory record plus, once
/// [`ZipIndex::parse_central_directory`] has run, every central record.
#[derive(Debug)]
pub struct ZipIndex {
    eocd: Eocd,
    entries: Vec<CentralEntry>,
}

impl ZipIndex {
    /// Parse the end-of-central-directory record out of a trailing chunk of
    /// the archive (or a previously cached trailer region).
    ///
    /// The record is located by scanning backwards for its signature, which
    /// skips over an optional trailing comment.
    pub fn from_trailer(data: &[u8]) -> FormatResult<Self> {
        if data.len() < rec::EOCD_MIN_LEN {
            return Err(FormatError::TooShort);
        }
        let eocd = rec::parse_eocd(data)?;

        if eocd.disk_number != 0 || eocd.cd_start_disk != 0 {
            return Err(FormatError::DiskSplitUnsupported);
        }
        if eocd.total_entries == 0xFFFF || eocd.cd_offset == 0xFFFF_FFFF {
            return Err(FormatError::Zip64Unsupported);
        }

        Ok(Self {
            eocd,
            entries: Vec::new(),
        })
    }

    /// Span of the EOCD record *relative to the trailer chunk* that was
    /// handed to [`ZipIndex::from_trailer`]. Used to cache exactly the
    /// validated region rather than the whole probe chunk.
    pub fn eocd_range(&self) -> ByteRange {
        ByteRange {
            offset: self.eocd.eocd_offset,
            size: self.eocd.eocd_size,
        }
    }

    /// Absolute span of the central directory inside the archive.
    pub fn cd_range(&self) -> ByteRange {
        ByteRange {
            offset: u64::from(self.eocd.cd_offset),
            size: u64::from(self.eocd.cd_size),
        }
    }

    /// Parse the central directory and return entry names in archive order.
    pub fn parse_central_directory(&mut self, data: &[u8]) -> FormatResult<Vec<String>> {
        self.entries = rec::parse_cd(data, self.eocd.total_entries as usize)?;
        Ok(self
            .entries
            .iter()
            .map(|e| e.file_name.clone())
            .collect())
    }

    /// Number of central-directory entries parsed so far.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The raw byte span holding `name`'s local header and payload.
    ///
    /// The end of the span is the smallest local-header offset greater than
    /// this entry's (entries are not required to be stored in offset
    /// order), bounded by the central directory itself.
    pub fn entry_range(&self, name: &str) -> FormatResult<ByteRange> {
        let entry = self.find_entry(name)?;
        let mut end = self.eocd.cd_offset;
        for next in &self.entries {
            if next.local_header_offset > entry.local_header_offset {
                end = end.min(next.local_header_offset);
            }
        }
        // a local-header offset at or past the directory start cannot
        // produce a valid span; reject it instead of wrapping
        let size = end
            .checked_sub(entry.local_header_offset)
            .and_then(|span| span.checked_sub(1))
            .ok_or_else(|| FormatError::BadLayout(name.to_string()))?;
        Ok(ByteRange {
            offset: u64::from(entry.local_header_offset),
            size: u64::from(size),
        })
    }

    /// Decode `name`'s payload from its raw byte span.
    ///
    /// `data` must be exactly the bytes of [`ZipIndex::entry_range`]: the
    /// local header, the payload, and (when the entry uses one) the
    /// trailing data descriptor.
    pub fn decode_entry(&self, name: &str, data: &[u8]) -> FormatResult<Vec<u8>> {
        let entry = self.find_entry(name)?;
        if entry.is_encrypted {
            return Err(FormatError::Encrypted(name.to_string()));
        }

        let local = rec::parse_local_header(data)?;
        if local.file_name != entry.file_name
            || local.crc32 != entry.crc32
            || local.is_encrypted != entry.is_encrypted
            || local.compressed_size != entry.compressed_size
            || local.uncompressed_size != entry.uncompressed_size
        {
            return Err(FormatError::HeaderMismatch(name.to_string()));
        }

        let start = local.data_offset;
        let end = start
            .checked_add(local.compressed_size as usize)
            .filter(|&e| e <= data.len())
            .ok_or(FormatError::Truncated)?;
        let payload = &data[start..end];

        match local.compression_method {
            COMPRESSION_STORED => Ok(payload.to_vec()),
            COMPRESSION_DEFLATED => {
                let mut out = Vec::with_capacity(local.uncompressed_size as usize);
                flate2::read::DeflateDecoder::new(payload)
                    .read_to_end(&mut out)
                    .map_err(|e| FormatError::Inflate(e.to_string()))?;
                Ok(out)
            }
            other => Err(FormatError::UnsupportedCompression(other)),
        }
    }

    fn find_entry(&self, name: &str) -> FormatResult<&CentralEntry> {
        self.entries
            .iter()
            .find(|e| e.file_name == name)
            .ok_or_else(|| FormatError::EntryNotFound(name.to_string()))
    }
}
