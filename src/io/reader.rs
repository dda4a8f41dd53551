use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::ReadAt;
use super::resource::{RangeBody, RangedResource};
use crate::error::{Error, Result};

/// Random-access reader over a [`RangedResource`].
///
/// Plain [`ReadAt::read_at`] calls are ephemeral: each one issues its own
/// range request and keeps no state, so any number of them may run
/// concurrently. Callers that know their access is sequential open a
/// [`CachedReader`] instead, which keeps one response open and serves
/// forward reads from it.
#[derive(Debug, Clone)]
pub struct RangedReader {
    resource: Arc<RangedResource>,
    cancel: CancellationToken,
}

impl RangedReader {
    /// Every request issued through this reader (and the sessions and
    /// sections it hands out) is aborted once `cancel` fires.
    pub fn new(resource: Arc<RangedResource>, cancel: CancellationToken) -> Self {
        Self { resource, cancel }
    }

    pub fn resource(&self) -> &Arc<RangedResource> {
        &self.resource
    }

    /// Start a cached session whose cursor may stream up to the end of the
    /// resource.
    pub fn cached(&self) -> CachedReader {
        self.cached_within(self.resource.size())
    }

    /// Start a cached session whose cursor never requests bytes past `end`,
    /// unless a read itself asks for them.
    pub fn cached_within(&self, end: u64) -> CachedReader {
        let limit = end.min(self.resource.size());
        CachedReader {
            cursor: Mutex::new(Cursor::new(
                self.resource.clone(),
                self.cancel.clone(),
                limit,
            )),
            size: self.resource.size(),
        }
    }

    /// Bounded streaming view of `length` bytes starting at `offset`.
    ///
    /// `length` may run past the end of the resource; reads then stop at the
    /// end. A non-empty section starting at or past the end is rejected.
    pub fn section_reader(&self, offset: u64, length: u64) -> Result<SectionReader> {
        let (start, end) = section_bounds(offset, length, self.resource.size())?;
        Ok(SectionReader {
            cursor: Cursor::new(self.resource.clone(), self.cancel.clone(), end),
            start,
            end,
            pos: start,
        })
    }
}

#[async_trait]
impl ReadAt for RangedReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Cursor::new(self.resource.clone(), self.cancel.clone(), 0)
            .read_at(offset, buf)
            .await
    }

    fn size(&self) -> u64 {
        self.resource.size()
    }
}

/// A cached read session: one open range response serving sequential reads.
///
/// A read starting exactly where the previous one stopped is served from the
/// open response; any other offset drops it and opens a fresh one. Reads are
/// serialized. The connection is released when the session is dropped or
/// [`CachedReader::close`]d.
#[derive(Debug)]
pub struct CachedReader {
    cursor: Mutex<Cursor>,
    size: u64,
}

impl CachedReader {
    /// Turn the session into a bounded section. If the session is positioned
    /// at `offset`, the section continues on the already open response;
    /// otherwise its first read requests the whole section.
    pub fn into_section(self, offset: u64, length: u64) -> Result<SectionReader> {
        let (start, end) = section_bounds(offset, length, self.size)?;
        let mut cursor = self.cursor.into_inner();
        cursor.limit = cursor.limit.max(end);
        Ok(SectionReader {
            cursor,
            start,
            end,
            pos: start,
        })
    }

    pub fn close(self) {
        drop(self);
    }
}

#[async_trait]
impl ReadAt for CachedReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.cursor.lock().await.read_at(offset, buf).await
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Bounded sequential view over part of a resource.
///
/// Reaching the bound yields `Ok(0)` (end of stream). The first read opens a
/// single range request for the whole section. Dropping the reader or
/// calling [`SectionReader::close`] releases the connection.
#[derive(Debug)]
pub struct SectionReader {
    cursor: Cursor,
    start: u64,
    end: u64,
    pos: u64,
}

impl SectionReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let left = usize::try_from(self.end - self.pos).unwrap_or(usize::MAX);
        let want = buf.len().min(left);
        if want == 0 {
            return Ok(0);
        }
        let n = self.cursor.read_at(self.pos, &mut buf[..want]).await?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Read until `buf` is full or the section ends.
    pub async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Offset of the first byte of the section
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Number of bytes the section will deliver in total
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Bytes delivered so far
    pub fn position(&self) -> u64 {
        self.pos - self.start
    }

    pub fn close(&mut self) {
        self.cursor.release();
        self.pos = self.end;
    }
}

fn section_bounds(offset: u64, length: u64, size: u64) -> Result<(u64, u64)> {
    if length > 0 && offset >= size {
        return Err(Error::invalid_range(offset, length, size));
    }
    Ok((offset.min(size), offset.saturating_add(length).min(size)))
}

/// Read position over at most one open range response.
#[derive(Debug)]
struct Cursor {
    resource: Arc<RangedResource>,
    cancel: CancellationToken,
    /// End offset used when a fresh range has to be opened
    limit: u64,
    pos: u64,
    body: Option<RangeBody>,
}

impl Cursor {
    fn new(resource: Arc<RangedResource>, cancel: CancellationToken, limit: u64) -> Self {
        Self {
            resource,
            cancel,
            limit,
            pos: 0,
            body: None,
        }
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.resource.size();
        if offset >= size {
            return Err(Error::invalid_range(offset, buf.len() as u64, size));
        }

        let end = offset.saturating_add(buf.len() as u64).min(size);
        let want = (end - offset) as usize;

        let mut body = match self.body.take() {
            Some(body) if self.pos == offset && body.remaining() >= want as u64 => body,
            stale => {
                drop(stale);
                self.resource
                    .fetch_range(offset, self.limit.max(end), &self.cancel)
                    .await?
            }
        };

        let mut filled = 0;
        while filled < want {
            let n = body.read(&mut buf[filled..want]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        self.pos = offset + filled as u64;
        if body.remaining() > 0 {
            self.body = Some(body);
        }
        Ok(filled)
    }

    fn release(&mut self) {
        self.body = None;
    }
}
