//! Low-level ZIP archive parser.
//!
//! This module handles the binary parsing of ZIP file structures,
//! reading from any source that implements the [`ReadAt`] trait.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Fetch a fixed window from the file's end and find the End of Central
//!    Directory (EOCD) in it, scanning backwards past any comment
//! 2. If ZIP64, follow the locator to the ZIP64 EOCD for 64-bit fields
//! 3. Fetch the Central Directory with a single read and parse every entry
//!
//! Only the tail and the directory are ever transferred; file data is
//! fetched later, one entry at a time.

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use std::io::{Cursor, Read};
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
const MAX_COMMENT_SIZE: u64 = 65535;

/// Size of the block read from the end of an archive to find its trailer.
///
/// Large enough for the longest possible comment, the EOCD record and a
/// ZIP64 locator in front of it, so well-formed archives need exactly one
/// request for the trailer.
pub const TRAILER_WINDOW: u64 =
    MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64 + Zip64EOCDLocator::SIZE as u64;

/// Location of the Central Directory inside the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryLocation {
    pub offset: u64,
    pub size: u64,
    pub entries: u64,
}

/// Read the trailer and the Central Directory of the archive behind
/// `reader` and return its entries in directory order.
///
/// Any parse failure aborts with [`Error::MalformedArchive`]; no partial
/// listing is returned.
pub async fn read_directory<R: ReadAt + ?Sized>(reader: &R) -> Result<Vec<ZipEntry>> {
    let size = reader.size();
    if size < EndOfCentralDirectory::SIZE as u64 {
        return Err(Error::malformed(format!(
            "{size} bytes is too small for a ZIP archive"
        )));
    }

    let window_start = size.saturating_sub(TRAILER_WINDOW);
    let mut window = vec![0u8; (size - window_start) as usize];
    read_exact_at(reader, window_start, &mut window).await?;

    let (eocd, eocd_offset) = find_eocd(&window, window_start)?;
    let location = locate_directory(reader, &window, window_start, &eocd, eocd_offset).await?;
    debug!(
        "central directory at {} ({} bytes, {} entries)",
        location.offset, location.size, location.entries
    );

    let mut cd_data = vec![0u8; location.size as usize];
    read_exact_at(reader, location.offset, &mut cd_data).await?;

    parse_central_directory(&cd_data, location.entries)
}

/// Find the End of Central Directory record in `window`, the last bytes of
/// the archive starting at absolute offset `window_start`.
///
/// Scans backwards from the end so a trailing comment is skipped; the
/// candidate closest to the end whose comment fits in the window wins.
pub fn find_eocd(window: &[u8], window_start: u64) -> Result<(EndOfCentralDirectory, u64)> {
    if window.len() < EndOfCentralDirectory::SIZE {
        return Err(Error::malformed("end of central directory not found"));
    }

    for i in (0..=window.len() - EndOfCentralDirectory::SIZE).rev() {
        if &window[i..i + 4] != EndOfCentralDirectory::SIGNATURE {
            continue;
        }
        let comment_len = u16::from_le_bytes([window[i + 20], window[i + 21]]) as usize;
        if i + EndOfCentralDirectory::SIZE + comment_len <= window.len() {
            let eocd = EndOfCentralDirectory::from_bytes(&window[i..])?;
            return Ok((eocd, window_start + i as u64));
        }
    }

    Err(Error::malformed("end of central directory not found"))
}

/// Work out where the Central Directory lives, following the ZIP64 locator
/// when the EOCD fields overflowed.
pub async fn locate_directory<R: ReadAt + ?Sized>(
    reader: &R,
    window: &[u8],
    window_start: u64,
    eocd: &EndOfCentralDirectory,
    eocd_offset: u64,
) -> Result<DirectoryLocation> {
    let (location, directory_end) = if eocd.is_zip64() {
        // The ZIP64 EOCD Locator is located immediately before the regular EOCD
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| Error::malformed("ZIP64 locator out of bounds"))?;
        let locator = if locator_offset >= window_start {
            let start = (locator_offset - window_start) as usize;
            Zip64EOCDLocator::from_bytes(&window[start..])?
        } else {
            let mut buf = [0u8; Zip64EOCDLocator::SIZE];
            read_exact_at(reader, locator_offset, &mut buf).await?;
            Zip64EOCDLocator::from_bytes(&buf)?
        };

        if locator.eocd64_offset.saturating_add(Zip64EOCD::MIN_SIZE as u64) > locator_offset {
            return Err(Error::malformed("ZIP64 end of central directory out of bounds"));
        }
        let mut buf = [0u8; Zip64EOCD::MIN_SIZE];
        read_exact_at(reader, locator.eocd64_offset, &mut buf).await?;
        let eocd64 = Zip64EOCD::from_bytes(&buf)?;

        (
            DirectoryLocation {
                offset: eocd64.cd_offset,
                size: eocd64.cd_size,
                entries: eocd64.total_entries,
            },
            locator.eocd64_offset,
        )
    } else {
        (
            DirectoryLocation {
                offset: eocd.cd_offset as u64,
                size: eocd.cd_size as u64,
                entries: eocd.total_entries as u64,
            },
            eocd_offset,
        )
    };

    let end = location
        .offset
        .checked_add(location.size)
        .ok_or_else(|| Error::malformed("central directory out of bounds"))?;
    if end > directory_end {
        return Err(Error::malformed(format!(
            "central directory {}..{end} overlaps its trailer at {directory_end}",
            location.offset
        )));
    }
    if location.entries.saturating_mul(CDFH_MIN_SIZE as u64) > location.size {
        return Err(Error::malformed(format!(
            "{} entries cannot fit in a {} byte central directory",
            location.entries, location.size
        )));
    }

    Ok(location)
}

/// Parse `count` consecutive Central Directory File Headers.
pub fn parse_central_directory(data: &[u8], count: u64) -> Result<Vec<ZipEntry>> {
    let mut cursor = Cursor::new(data);
    let mut entries = Vec::with_capacity(count.min(data.len() as u64 / CDFH_MIN_SIZE as u64) as usize);

    for index in 0..count {
        let entry = parse_cdfh(&mut cursor).map_err(|err| match err {
            Error::MalformedArchive(msg) => {
                Error::malformed(format!("central directory entry {index}: {msg}"))
            }
            other => other,
        })?;
        entries.push(entry);
    }

    Ok(entries)
}

/// Parse a Central Directory File Header from a cursor.
///
/// The CDFH contains metadata about a file in the archive, including
/// its name, sizes, and location of the actual file data.
fn parse_cdfh(cursor: &mut Cursor<&[u8]>) -> Result<ZipEntry> {
    // Read and verify the signature (PK\x01\x02)
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig).map_err(truncated)?;
    if sig != CDFH_SIGNATURE {
        return Err(Error::malformed("invalid central directory file header"));
    }

    let _version_made_by = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _version_needed = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _flags = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let compression_method = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let last_mod_time = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let last_mod_date = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let crc32 = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>().map_err(truncated)? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let extra_field_length = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let file_comment_length = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    let _external_attrs = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>().map_err(truncated)? as u64;

    let mut file_name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut file_name_bytes).map_err(truncated)?;
    // Use lossy conversion to handle non-UTF8 filenames gracefully
    let name = String::from_utf8_lossy(&file_name_bytes).into_owned();

    let extra_field_end = cursor.position() + extra_field_length as u64;
    let record_end = extra_field_end + file_comment_length as u64;
    if record_end > cursor.get_ref().len() as u64 {
        return Err(Error::malformed(format!("record for {name} is truncated")));
    }

    while cursor.position() + 4 <= extra_field_end {
        let header_id = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let field_size = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        let field_end = cursor.position() + field_size as u64;

        if header_id == 0x0001 {
            // ZIP64 extended information: a field is present only if the
            // corresponding header field is 0xFFFFFFFF
            if uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
            if compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                compressed_size = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
            if lfh_offset == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                lfh_offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
            }
        }
        cursor.set_position(field_end);
    }

    // Skip over any trailing extra bytes and the file comment
    cursor.set_position(record_end);

    Ok(ZipEntry {
        name,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        lfh_offset,
        last_mod_time,
        last_mod_date,
        header_hint: LFH_SIZE as u64 + file_name_length as u64 + extra_field_length as u64,
        data_offset: OnceLock::new(),
    })
}

/// Given the fixed part of a Local File Header, return the offset of the
/// entry's data.
///
/// The LFH has variable-length fields (file name, extra field) that may
/// differ from the Central Directory record, so the data offset has to be
/// taken from the LFH itself.
pub fn data_offset(lfh: &[u8], lfh_offset: u64) -> Result<u64> {
    if lfh.len() < LFH_SIZE || &lfh[0..4] != LFH_SIGNATURE {
        return Err(Error::malformed(format!(
            "invalid local file header at {lfh_offset}"
        )));
    }

    let mut cursor = Cursor::new(&lfh[26..LFH_SIZE]);
    let file_name_length = cursor.read_u16::<LittleEndian>().map_err(truncated)? as u64;
    let extra_field_length = cursor.read_u16::<LittleEndian>().map_err(truncated)? as u64;

    // Data starts after: LFH (30 bytes) + filename + extra field
    Ok(lfh_offset + LFH_SIZE as u64 + file_name_length + extra_field_length)
}

async fn read_exact_at<R: ReadAt + ?Sized>(reader: &R, offset: u64, buf: &mut [u8]) -> Result<()> {
    let n = reader.read_at(offset, buf).await?;
    if n < buf.len() {
        return Err(Error::malformed(format!(
            "archive ends {} bytes early at {offset}",
            buf.len() - n
        )));
    }
    Ok(())
}
