//! Content resolution for one project request.
//!
//! [`ContentServer::serve`] tries the project's archive first, then the
//! request path as a standalone object, and reports [`Served::NotServed`]
//! when neither exists so the HTTP layer can render its not-found page.

mod metadata;

pub use metadata::Metadata;

use http::HeaderMap;
use log::debug;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cache::ArchiveCache;
use crate::config::ServeConfig;
use crate::error::{Error, Result};
use crate::io::{RangedReader, SectionReader};
use crate::path;
use crate::store::ObjectStore;
use crate::zip::{ArchiveIndex, EntryReader};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Where a request's content lives, as resolved by the tenant layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupPath {
    /// Key of the project's cached archive index
    pub project_id: u64,
    /// Object key prefix of the project's files, e.g. `group/project/public/`
    pub path: String,
    /// Access-controlled content must not be cached by intermediaries
    pub has_access_control: bool,
}

impl LookupPath {
    pub fn new(project_id: u64, path: impl Into<String>) -> Self {
        Self {
            project_id,
            path: path.into(),
            has_access_control: false,
        }
    }

    pub fn with_access_control(mut self, has_access_control: bool) -> Self {
        self.has_access_control = has_access_control;
        self
    }

    /// Object key of `name` below this path
    pub fn object_key(&self, name: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), name)
    }
}

/// Outcome of [`ContentServer::serve`]
#[derive(Debug)]
pub enum Served {
    Content(Content),
    /// Neither the archive nor the object store has the file
    NotServed,
}

/// Whether content came out of the project archive or a standalone object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Archive,
    Object,
}

/// A resolved file: response headers plus a body still to be streamed
#[derive(Debug)]
pub struct Content {
    pub headers: HeaderMap,
    pub body: ContentBody,
    pub source: Source,
}

/// Body stream of served content; close it (or drop it) on every exit path
/// to release the connection behind it.
#[derive(Debug)]
pub enum ContentBody {
    Entry(EntryReader),
    Object(SectionReader),
}

impl ContentBody {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            ContentBody::Entry(reader) => reader.read(buf).await,
            ContentBody::Object(reader) => reader.read(buf).await,
        }
    }

    /// Stream the whole body into `writer` and close it. Returns the number
    /// of bytes written.
    pub async fn copy_to<W: AsyncWrite + Unpin + ?Sized>(&mut self, writer: &mut W) -> Result<u64> {
        let result = self.copy_inner(writer).await;
        self.close();
        result
    }

    async fn copy_inner<W: AsyncWrite + Unpin + ?Sized>(&mut self, writer: &mut W) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| Error::transport(format!("failed to write response: {e}")))?;
            total += n as u64;
        }
        writer
            .flush()
            .await
            .map_err(|e| Error::transport(format!("failed to write response: {e}")))?;
        Ok(total)
    }

    /// Read the whole body into memory and close it.
    pub async fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.copy_to(&mut out).await?;
        Ok(out)
    }

    pub fn close(&mut self) {
        match self {
            ContentBody::Entry(reader) => reader.close(),
            ContentBody::Object(reader) => reader.close(),
        }
    }
}

/// Resolves project files from archives and standalone objects
#[derive(Debug, Clone)]
pub struct ContentServer {
    store: Arc<dyn ObjectStore>,
    cache: Arc<ArchiveCache>,
    config: ServeConfig,
}

impl ContentServer {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<ArchiveCache>, config: ServeConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ArchiveCache> {
        &self.cache
    }

    /// Resolve `sub_path` of the project at `lookup`.
    ///
    /// Not-found outcomes never surface as errors: a missing archive or a
    /// missing entry falls back to the standalone object, and a missing
    /// object is [`Served::NotServed`]. Errors are server-side failures.
    pub async fn serve(
        &self,
        lookup: &LookupPath,
        sub_path: &str,
        cancel: &CancellationToken,
    ) -> Result<Served> {
        let name = path::normalize(sub_path);

        if let Some(index) = self.archive(lookup, cancel).await? {
            match index.open(&name, cancel).await {
                Ok((reader, entry)) => {
                    let meta = Metadata::new(&entry.name, entry.size, entry.modified);
                    return Ok(Served::Content(Content {
                        headers: self.headers(lookup, &meta),
                        body: ContentBody::Entry(reader),
                        source: Source::Archive,
                    }));
                }
                Err(Error::EntryNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        self.serve_object(lookup, &name, cancel).await
    }

    /// Archive index of the project, building it on first use.
    pub async fn archive(
        &self,
        lookup: &LookupPath,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<ArchiveIndex>>> {
        let key = lookup.object_key(&self.config.archive_name);
        self.cache
            .get(lookup.project_id, || async {
                let resource = self.store.get_object(&key, cancel).await?;
                ArchiveIndex::build(resource, cancel).await
            })
            .await
    }

    async fn serve_object(
        &self,
        lookup: &LookupPath,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Served> {
        let key = lookup.object_key(name);
        let resource = match self.store.get_object(&key, cancel).await {
            Ok(resource) => resource,
            Err(Error::NotFound(_)) => {
                debug!("project {}: nothing at {key}", lookup.project_id);
                return Ok(Served::NotServed);
            }
            Err(err) => return Err(err),
        };

        let meta = Metadata::new(name, resource.size(), resource.last_modified());
        let body = RangedReader::new(resource.clone(), cancel.clone())
            .section_reader(0, resource.size())?;
        Ok(Served::Content(Content {
            headers: self.headers(lookup, &meta),
            body: ContentBody::Object(body),
            source: Source::Object,
        }))
    }

    fn headers(&self, lookup: &LookupPath, meta: &Metadata) -> HeaderMap {
        let max_age = (!lookup.has_access_control).then_some(self.config.cache_max_age);
        meta.to_headers(max_age, SystemTime::now())
    }
}
