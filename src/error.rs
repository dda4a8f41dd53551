use thiserror::Error;

/// Errors produced while resolving content from the object store.
///
/// `Clone` so that a single failed archive build can be handed to every
/// request that was waiting on it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The object does not exist in the store.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The archive exists but has no entry with this name.
    #[error("entry not found in archive: {0}")]
    EntryNotFound(String),

    /// Requested bytes lie outside the resource.
    #[error("invalid range: offset {offset}, length {length}, size {size}")]
    InvalidRange { offset: u64, length: u64, size: u64 },

    /// The archive trailer or directory could not be parsed, or an entry
    /// failed its integrity check.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(u16),

    /// Network or backend failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    pub fn invalid_range(offset: u64, length: u64, size: u64) -> Self {
        Self::InvalidRange {
            offset,
            length,
            size,
        }
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedArchive(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// True for the expected "nothing there" outcomes that drive fallback
    /// rather than failing a request.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::EntryNotFound(_))
    }

    /// True when the end user should see a generic server failure instead
    /// of a not-found page.
    pub fn is_server_failure(&self) -> bool {
        !self.is_not_found() && !matches!(self, Error::Cancelled)
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_kinds_are_not_failures() {
        assert!(Error::NotFound("a".into()).is_not_found());
        assert!(Error::EntryNotFound("a".into()).is_not_found());
        assert!(!Error::NotFound("a".into()).is_server_failure());
        assert!(!Error::Cancelled.is_server_failure());
    }

    #[test]
    fn integrity_and_transport_are_failures() {
        assert!(Error::malformed("bad trailer").is_server_failure());
        assert!(Error::transport("reset").is_server_failure());
        assert!(Error::invalid_range(31, 1, 31).is_server_failure());
        assert_eq!(
            Error::invalid_range(31, 1, 30).to_string(),
            "invalid range: offset 31, length 1, size 30"
        );
    }
}
