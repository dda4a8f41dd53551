//! # zipages
//!
//! Serve static-site files straight out of ZIP archives kept in a remote
//! object store, without downloading the archives.
//!
//! Objects are read with HTTP Range requests only. A project's archive is
//! indexed once from its trailer and Central Directory (two requests), the
//! index is cached per project, and every served file then costs a single
//! range request for its compressed bytes. Projects without an archive fall
//! back to standalone objects.
//!
//! ## Features
//!
//! - Ephemeral (stateless, concurrent) and cached (one open response) range reads
//! - ZIP64 archives, STORED and DEFLATE entries, CRC-32 verification
//! - Per-project archive cache with negative caching and single-flight builds
//! - `Content-Type`, `Last-Modified` and caching headers for served files
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use zipages::{
//!     ArchiveCache, ContentServer, HttpObjectStore, LookupPath, ServeConfig, Served, StoreConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = HttpObjectStore::new("https://objects.example.com/pages", StoreConfig::default())?;
//!     let server = ContentServer::new(
//!         Arc::new(store),
//!         Arc::new(ArchiveCache::new()),
//!         ServeConfig::default(),
//!     );
//!
//!     let lookup = LookupPath::new(42, "group/project/public/");
//!     match server.serve(&lookup, "/", &CancellationToken::new()).await? {
//!         Served::Content(mut content) => {
//!             let body = content.body.read_to_vec().await?;
//!             println!("{} bytes", body.len());
//!         }
//!         Served::NotServed => println!("not found"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod path;
pub mod serving;
pub mod store;
pub mod zip;

pub use cache::ArchiveCache;
pub use cli::Cli;
pub use config::{ServeConfig, StoreConfig};
pub use error::{Error, Result};
pub use io::{CachedReader, RangedReader, RangedResource, ReadAt, SectionReader, TransferStats};
pub use serving::{Content, ContentBody, ContentServer, LookupPath, Served, Source};
pub use store::{HttpObjectStore, ObjectStore};
pub use zip::{ArchiveIndex, EntryMetadata, EntryReader, ZipEntry};
