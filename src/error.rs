//! Error taxonomy shared by every layer of the engine.

use std::io;

use thiserror::Error;

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error taxonomy.
///
/// `Rollback` and `Timeout` are the retriable pair: the transaction runner
/// catches only those and restarts the closure. `Corruption` is fatal for the
/// affected volume but leaves the rest of the engine serving.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("resource busy: {0}")]
    InUse(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transaction rolled back: {0}")]
    Rollback(String),
    #[error("volume full: {0}")]
    VolumeFull(String),
    #[error("volume is read-only: {0}")]
    ReadOnly(String),
    #[error("interrupted")]
    Interrupted,
    #[error("journal unusable: {0}")]
    JournalPanic(String),
    #[error("mvv versions out of order: {0}")]
    VersionsOutOfOrder(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Structural fault on a specific page.
    pub fn corrupt_page(page: u64, nature: impl AsRef<str>) -> Self {
        Error::Corruption(format!("page {}: {}", page, nature.as_ref()))
    }

    /// True for the error kinds a transaction runner may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Rollback(_) | Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::Rollback("ww conflict".into()).is_retryable());
        assert!(Error::Timeout("ww lock".into()).is_retryable());
        assert!(!Error::Corruption("bad page".into()).is_retryable());
        assert!(!Error::Interrupted.is_retryable());
    }

    #[test]
    fn corrupt_page_names_the_page() {
        let err = Error::corrupt_page(17, "type tag mismatch");
        assert!(err.to_string().contains("page 17"));
    }
}
