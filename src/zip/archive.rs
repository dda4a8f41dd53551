use flate2::{Decompress, FlushDecompress, Status};
use log::{debug, error};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::io::{RangedReader, RangedResource, ReadAt, SectionReader};
use crate::path;

use super::parser;
use super::structures::{CompressionMethod, LFH_SIZE, ZipEntry};

/// Input buffer size for inflating entries
const INFLATE_BUFFER_SIZE: usize = 32 * 1024;

/// Room allowed for a local extra field longer than the directory's copy
const LOCAL_EXTRA_SLACK: u64 = 256;

/// Parsed directory of a remote archive.
///
/// Built once from the archive's trailer and Central Directory, then
/// immutable: lookups are a pure name to entry mapping. File data is fetched
/// per entry with range requests when an entry is opened.
#[derive(Debug)]
pub struct ArchiveIndex {
    resource: Arc<RangedResource>,
    entries: Vec<ZipEntry>,
    by_name: HashMap<String, usize>,
}

impl ArchiveIndex {
    /// Read the trailer and directory of `resource` and index its files.
    ///
    /// Directory records (names ending in `/`) are not indexed. File names
    /// are normalized the same way request paths are, and when a name occurs
    /// more than once the last record wins, as with most unzip tools.
    pub async fn build(resource: Arc<RangedResource>, cancel: &CancellationToken) -> Result<Self> {
        let reader = RangedReader::new(resource.clone(), cancel.clone());
        let entries = parser::read_directory(&reader).await.inspect_err(|err| {
            if let Error::MalformedArchive(msg) = err {
                error!("archive {} is malformed: {msg}", resource.url());
            }
        })?;
        debug!(
            "indexed {} with {} directory records",
            resource.url(),
            entries.len()
        );
        Ok(Self::from_entries(resource, entries))
    }

    fn from_entries(resource: Arc<RangedResource>, records: Vec<ZipEntry>) -> Self {
        let mut entries: Vec<ZipEntry> = Vec::with_capacity(records.len());
        let mut by_name = HashMap::with_capacity(records.len());

        for record in records {
            // directory records, including `dir/.` and `dir/..` spellings
            if matches!(record.name.rsplit('/').next(), Some("" | "." | "..")) {
                continue;
            }
            let key = path::normalize(&record.name);
            match by_name.get(&key) {
                Some(&index) => entries[index] = record,
                None => {
                    by_name.insert(key, entries.len());
                    entries.push(record);
                }
            }
        }

        Self {
            resource,
            entries,
            by_name,
        }
    }

    pub fn resource(&self) -> &Arc<RangedResource> {
        &self.resource
    }

    /// Number of indexed files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Indexed files in directory order
    pub fn entries(&self) -> impl Iterator<Item = &ZipEntry> {
        self.entries.iter()
    }

    /// Look up an entry by its normalized name.
    pub fn entry(&self, name: &str) -> Option<&ZipEntry> {
        self.by_name.get(name).map(|&index| &self.entries[index])
    }

    /// Open an entry for streaming.
    ///
    /// `name` is normalized first, so `""` and `"docs/"` open the respective
    /// `index.html`. A missing entry is [`Error::EntryNotFound`]. The first
    /// open of an entry reads its local header and data over one response;
    /// later opens request exactly the entry's data span.
    pub async fn open(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(EntryReader, EntryMetadata)> {
        let name = path::normalize(name);
        let Some(entry) = self.entry(&name) else {
            debug!("{name} is not in {}", self.resource.url());
            return Err(Error::EntryNotFound(name));
        };
        if let CompressionMethod::Unknown(method) = entry.compression_method {
            return Err(Error::UnsupportedCompression(method));
        }

        let reader = RangedReader::new(self.resource.clone(), cancel.clone());
        let section = match entry.data_offset.get() {
            Some(&offset) => reader.section_reader(offset, entry.compressed_size)?,
            None => self.locate_data(&reader, entry).await?,
        };

        let metadata = EntryMetadata {
            name: entry.name.clone(),
            size: entry.uncompressed_size,
            modified: entry.modified(),
            compression_method: entry.compression_method,
        };
        Ok((EntryReader::new(section, entry), metadata))
    }

    /// Read the entry's local header and continue into its data on the same
    /// response, remembering where the data starts.
    async fn locate_data(&self, reader: &RangedReader, entry: &ZipEntry) -> Result<SectionReader> {
        let size = self.resource.size();
        if entry.lfh_offset.saturating_add(LFH_SIZE as u64) > size {
            return Err(Error::malformed(format!(
                "local header of {} lies past the end of the archive",
                entry.name
            )));
        }

        // The local header usually matches the directory record give or take
        // a few extra-field bytes. A longer one costs a second request.
        let bound = entry
            .lfh_offset
            .saturating_add(entry.header_hint + LOCAL_EXTRA_SLACK)
            .saturating_add(entry.compressed_size);
        let session = reader.cached_within(bound);

        let mut lfh = [0u8; LFH_SIZE];
        session.read_at(entry.lfh_offset, &mut lfh).await?;
        let offset = parser::data_offset(&lfh, entry.lfh_offset)?;

        if offset.saturating_add(entry.compressed_size) > size {
            return Err(Error::malformed(format!(
                "data of {} lies past the end of the archive",
                entry.name
            )));
        }

        let _ = entry.data_offset.set(offset);
        if offset + entry.compressed_size > bound {
            session.close();
            return reader.section_reader(offset, entry.compressed_size);
        }

        // Skip the variable part of the header without leaving the response
        let mut skip = vec![0u8; (offset - entry.lfh_offset) as usize - LFH_SIZE];
        if !skip.is_empty() {
            session
                .read_at(entry.lfh_offset + LFH_SIZE as u64, &mut skip)
                .await?;
        }

        session.into_section(offset, entry.compressed_size)
    }
}

/// Metadata of an opened entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub name: String,
    /// Uncompressed size in bytes
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub compression_method: CompressionMethod,
}

/// Decompressing stream over one archive entry.
///
/// The CRC-32 and size recorded in the directory are verified when the
/// stream ends; a mismatch fails the final read with
/// [`Error::MalformedArchive`].
pub struct EntryReader {
    section: SectionReader,
    decoder: Decoder,
    name: String,
    hasher: crc32fast::Hasher,
    expected_crc: u32,
    expected_size: u64,
    produced: u64,
    done: bool,
}

impl std::fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("name", &self.name)
            .field("decoder", &self.decoder)
            .field("produced", &self.produced)
            .field("expected_size", &self.expected_size)
            .field("done", &self.done)
            .finish()
    }
}

impl EntryReader {
    fn new(section: SectionReader, entry: &ZipEntry) -> Self {
        let decoder = match entry.compression_method {
            CompressionMethod::Deflate => Decoder::Deflate(Box::new(Inflate::new())),
            _ => Decoder::Stored,
        };
        Self {
            section,
            decoder,
            name: entry.name.clone(),
            hasher: crc32fast::Hasher::new(),
            expected_crc: entry.crc32,
            expected_size: entry.uncompressed_size,
            produced: 0,
            done: false,
        }
    }

    /// Read decompressed bytes into `buf`; 0 means the entry is complete.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.done {
            return Ok(0);
        }

        let n = match &mut self.decoder {
            Decoder::Stored => self.section.read(buf).await?,
            Decoder::Deflate(inflate) => inflate.read(&mut self.section, buf).await?,
        };
        if n == 0 {
            self.finish()?;
            return Ok(0);
        }

        self.produced += n as u64;
        if self.produced > self.expected_size {
            self.close();
            return Err(Error::malformed(format!(
                "{} inflates past its recorded size of {} bytes",
                self.name, self.expected_size
            )));
        }
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    /// Read the rest of the entry into `out`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = vec![0u8; INFLATE_BUFFER_SIZE];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    /// Release the underlying connection; further reads return 0.
    pub fn close(&mut self) {
        self.done = true;
        self.section.close();
    }

    fn finish(&mut self) -> Result<()> {
        self.close();
        if self.produced != self.expected_size {
            return Err(Error::malformed(format!(
                "{} ended after {} of {} bytes",
                self.name, self.produced, self.expected_size
            )));
        }
        let crc = self.hasher.clone().finalize();
        if crc != self.expected_crc {
            return Err(Error::malformed(format!(
                "{} failed its CRC check: {crc:08x} != {:08x}",
                self.name, self.expected_crc
            )));
        }
        Ok(())
    }
}

/// Decoding applied to an entry's stored bytes
#[derive(Debug)]
enum Decoder {
    Stored,
    Deflate(Box<Inflate>),
}

/// Raw DEFLATE decoder fed from a section reader
struct Inflate {
    inflater: Decompress,
    input: Vec<u8>,
    start: usize,
    end: usize,
    input_done: bool,
    finished: bool,
}

impl std::fmt::Debug for Inflate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflate")
            .field("total_in", &self.inflater.total_in())
            .field("total_out", &self.inflater.total_out())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Inflate {
    fn new() -> Self {
        Self {
            // ZIP stores raw deflate streams, without a zlib header
            inflater: Decompress::new(false),
            input: vec![0u8; INFLATE_BUFFER_SIZE],
            start: 0,
            end: 0,
            input_done: false,
            finished: false,
        }
    }

    async fn read(&mut self, source: &mut SectionReader, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.finished {
                return Ok(0);
            }
            if self.start == self.end && !self.input_done {
                let n = source.read(&mut self.input).await?;
                self.start = 0;
                self.end = n;
                self.input_done = n == 0;
            }

            let flush = if self.input_done {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();
            let status = self
                .inflater
                .decompress(&self.input[self.start..self.end], buf, flush)
                .map_err(|e| Error::malformed(format!("invalid deflate data: {e}")))?;
            let consumed = (self.inflater.total_in() - in_before) as usize;
            let produced = (self.inflater.total_out() - out_before) as usize;
            self.start += consumed;

            if status == Status::StreamEnd {
                self.finished = true;
            }
            if produced > 0 {
                return Ok(produced);
            }
            if self.finished {
                return Ok(0);
            }
            if consumed == 0 && (self.input_done || self.start < self.end) {
                return Err(Error::malformed("deflate stream is truncated"));
            }
        }
    }
}
