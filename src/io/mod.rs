mod reader;
mod resource;

pub use reader::{CachedReader, RangedReader, SectionReader};
pub use resource::{RangeBody, RangedResource, TransferStats};

use crate::error::Result;
use async_trait::async_trait;

/// Trait for positional reads from a remote data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at `offset` into the buffer.
    ///
    /// Fills the whole buffer unless the source ends first; a short count
    /// means the end was reached. An empty buffer always succeeds. A
    /// non-empty read starting at or past the end fails with
    /// [`Error::InvalidRange`](crate::Error::InvalidRange).
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;
}
