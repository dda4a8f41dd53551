//! ZIP archive indexing and entry streaming over range requests.
//!
//! - [`structures`]: records of the ZIP format (EOCD, ZIP64 trailer, entries)
//! - [`parser`]: trailer and Central Directory parsing from any [`ReadAt`](crate::io::ReadAt)
//! - [`archive`]: the name to entry index and decompressing entry readers
//!
//! An archive is read from its end: one request for the trailer window, one
//! for the Central Directory. File data is only fetched when an entry is
//! opened.
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - Only STORED and DEFLATE entries can be opened

mod archive;
pub mod parser;
mod structures;

pub use archive::{ArchiveIndex, EntryMetadata, EntryReader};
pub use structures::*;
