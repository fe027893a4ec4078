//! Binary record parsing for the supported ZIP subset.

use byteorder::{LittleEndian, ReadBytesExt};
use encoding_rs::SHIFT_JIS;

use std::io::{Cursor, Read};

use crate::{FormatError, FormatResult};

pub(crate) const LFH_SIGNATURE: u32 = 0x0403_4b50;
pub(crate) const CD_SIGNATURE: u32 = 0x0201_4b50;
pub(crate) const EOCD_SIGNATURE: u32 = 0x0605_4b50;

pub(crate) const COMPRESSION_STORED: u16 = 0;
pub(crate) const COMPRESSION_DEFLATED: u16 = 8;

/// EOCD without the optional comment: 22 bytes.
pub(crate) const EOCD_MIN_LEN: usize = 22;

const FLAG_ENCRYPTED: u16 = 1;
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const FLAG_UTF8_NAME: u16 = 1 << 11;

/// End-of-central-directory record.
#[derive(Debug, Clone)]
pub struct Eocd {
    pub disk_number: u16,
    pub cd_start_disk: u16,
    pub entries_on_disk: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment: Vec<u8>,

    /// Offset of the record inside the buffer it was parsed from.
    pub eocd_offset: u64,
    /// Record length including the comment.
    pub eocd_size: u64,
}

/// One central-directory record (the fields the reader needs).
#[derive(Debug, Clone)]
pub struct CentralEntry {
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub local_header_offset: u32,
    pub file_name: String,
    pub is_encrypted: bool,
}

/// Fields of a local file header relevant for verification and decoding,
/// with data-descriptor values already folded in.
pub(crate) struct LocalHeader {
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name: String,
    pub is_encrypted: bool,
    /// Offset of the payload within the parsed buffer.
    pub data_offset: usize,
}

/// Locate and parse the EOCD record by scanning backwards over an optional
/// trailing comment. `data` is a trailing chunk of the archive.
pub(crate) fn parse_eocd(data: &[u8]) -> FormatResult<Eocd> {
    let mut pos = data.len() - EOCD_MIN_LEN;
    let start = loop {
        if data[pos..pos + 4] == EOCD_SIGNATURE.to_le_bytes() {
            break pos;
        }
        pos = pos.checked_sub(1).ok_or(FormatError::MissingSignature("EOCD"))?;
    };

    let mut cur = Cursor::new(&data[start + 4..]);
    let disk_number = cur.read_u16::<LittleEndian>()?;
    let cd_start_disk = cur.read_u16::<LittleEndian>()?;
    let entries_on_disk = cur.read_u16::<LittleEndian>()?;
    let total_entries = cur.read_u16::<LittleEndian>()?;
    let cd_size = cur.read_u32::<LittleEndian>()?;
    let cd_offset = cur.read_u32::<LittleEndian>()?;
    let comment_len = cur.read_u16::<LittleEndian>()? as usize;
    let comment = read_exact(&mut cur, comment_len)?;

    Ok(Eocd {
        disk_number,
        cd_start_disk,
        entries_on_disk,
        total_entries,
        cd_size,
        cd_offset,
        comment,
        eocd_offset: start as u64,
        eocd_size: (EOCD_MIN_LEN + comment_len) as u64,
    })
}

/// Parse `count` central-directory records in archive order.
pub(crate) fn parse_cd(data: &[u8], count: usize) -> FormatResult<Vec<CentralEntry>> {
    let mut cur = Cursor::new(data);
    let mut entries = Vec::with_capacity(count);

    while entries.len() < count {
        let signature = cur.read_u32::<LittleEndian>()?;
        if signature != CD_SIGNATURE {
            return Err(FormatError::MissingSignature("central directory"));
        }

        let _version_made_by = cur.read_u16::<LittleEndian>()?;
        let _version_needed = cur.read_u16::<LittleEndian>()?;
        let flags = cur.read_u16::<LittleEndian>()?;
        let compression_method = cur.read_u16::<LittleEndian>()?;
        let _mod_time = cur.read_u16::<LittleEndian>()?;
        let _mod_date = cur.read_u16::<LittleEndian>()?;
        let crc32 = cur.read_u32::<LittleEndian>()?;
        let compressed_size = cur.read_u32::<LittleEndian>()?;
        let uncompressed_size = cur.read_u32::<LittleEndian>()?;
        let name_len = cur.read_u16::<LittleEndian>()? as usize;
        let extra_len = cur.read_u16::<LittleEndian>()? as usize;
        let comment_len = cur.read_u16::<LittleEndian>()? as usize;
        let _disk_start = cur.read_u16::<LittleEndian>()?;
        let _internal_attrs = cur.read_u16::<LittleEndian>()?;
        let _external_attrs = cur.read_u32::<LittleEndian>()?;
        let local_header_offset = cur.read_u32::<LittleEndian>()?;
        let name_bytes = read_exact(&mut cur, name_len)?;
        let _extra = read_exact(&mut cur, extra_len)?;
        let _comment = read_exact(&mut cur, comment_len)?;

        let is_utf8 = flags & FLAG_UTF8_NAME != 0;
        let file_name = decode_file_name(&name_bytes, is_utf8)?;

        entries.push(CentralEntry {
            compression_method,
            crc32,
            compressed_size,
            uncompressed_size,
            local_header_offset,
            file_name,
            is_encrypted: flags & FLAG_ENCRYPTED != 0,
        });
    }

    Ok(entries)
}

/// Parse a local file header at the start of `data`.
///
/// When the entry was written with a data descriptor (crc/sizes deferred),
/// the descriptor values are read from the last 12 bytes of the span, which
/// ends right before the next header.
pub(crate) fn parse_local_header(data: &[u8]) -> FormatResult<LocalHeader> {
    let mut cur = Cursor::new(data);
    let signature = cur.read_u32::<LittleEndian>()?;
    if signature != LFH_SIGNATURE {
        return Err(FormatError::MissingSignature("local header"));
    }

    let _version_needed = cur.read_u16::<LittleEndian>()?;
    let flags = cur.read_u16::<LittleEndian>()?;
    let compression_method = cur.read_u16::<LittleEndian>()?;
    let _mod_time = cur.read_u16::<LittleEndian>()?;
    let _mod_date = cur.read_u16::<LittleEndian>()?;
    let mut crc32 = cur.read_u32::<LittleEndian>()?;
    let mut compressed_size = cur.read_u32::<LittleEndian>()?;
    let mut uncompressed_size = cur.read_u32::<LittleEndian>()?;
    let name_len = cur.read_u16::<LittleEndian>()? as usize;
    let extra_len = cur.read_u16::<LittleEndian>()? as usize;
    let name_bytes = read_exact(&mut cur, name_len)?;
    let data_offset = cur.position() as usize + extra_len;
    if data_offset > data.len() {
        return Err(FormatError::Truncated);
    }

    if flags & FLAG_DATA_DESCRIPTOR != 0 {
        if data.len() < 12 {
            return Err(FormatError::Truncated);
        }
        let mut tail = Cursor::new(&data[data.len() - 12..]);
        crc32 = tail.read_u32::<LittleEndian>()?;
        compressed_size = tail.read_u32::<LittleEndian>()?;
        uncompressed_size = tail.read_u32::<LittleEndian>()?;
    }

    let is_utf8 = flags & FLAG_UTF8_NAME != 0;
    let file_name = decode_file_name(&name_bytes, is_utf8)?;

    Ok(LocalHeader {
        compression_method,
        crc32,
        compressed_size,
        uncompressed_size,
        file_name,
        is_encrypted: flags & FLAG_ENCRYPTED != 0,
        data_offset,
    })
}

fn decode_file_name(bytes: &[u8], is_utf8: bool) -> FormatResult<String> {
    if is_utf8 {
        return String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::NameEncoding);
    }
    let (decoded, _, had_errors) = SHIFT_JIS.decode(bytes);
    if had_errors {
        return Err(FormatError::NameEncoding);
    }
    Ok(decoded.into_owned())
}

fn read_exact(cur: &mut Cursor<&[u8]>, len: usize) -> FormatResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}
