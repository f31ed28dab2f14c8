//! Error taxonomy for the storage engine.

use crate::types::PageAddress;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur anywhere in the storage engine.
///
/// Every public operation either fully succeeds or returns one of these
/// without mutating on-disk state beyond journal records a later abort will
/// neutralize.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A parameter violates a documented precondition.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Requested key size exceeds what this database was configured for.
    #[error("invalid key size: {size} bytes (configured max {max})")]
    InvalidKeySize { size: usize, max: usize },

    /// Requested page size is unsupported (not a power of two, too small, or
    /// mismatched against an existing file).
    #[error("invalid page size: {0}")]
    InvalidPageSize(String),

    /// Allocation failed (freelist exhausted and device extension failed).
    #[error("out of memory")]
    OutOfMemory,

    /// The file header's magic or version is not recognized.
    #[error("invalid file header: {0}")]
    InvalidFileHeader(String),

    /// The file header version is recognized but unsupported.
    #[error("invalid file version: {0}")]
    InvalidFileVersion(String),

    /// Lookup found no matching key.
    #[error("key not found")]
    KeyNotFound,

    /// Insert without `OVERWRITE`/`DUPLICATE` collided with an existing key.
    #[error("duplicate key")]
    DuplicateKey,

    /// `check_integrity` detected a structural violation.
    #[error("integrity violated: {0}")]
    IntegrityViolated(String),

    /// A blob's header sanity check failed, or the blob id does not resolve.
    #[error("blob not found: {0}")]
    BlobNotFound(u64),

    /// Operation requires a coupled cursor but the cursor is nil.
    #[error("cursor is nil")]
    CursorIsNil,

    /// The journal holds uncommitted state that must be replayed before use.
    #[error("environment needs recovery")]
    NeedRecovery,

    /// A journal file's header is invalid.
    #[error("invalid journal file header: {0}")]
    LogInvalidFileHeader(String),

    /// A hard resource limit was reached (e.g. lsn approaching overflow).
    #[error("limit reached: {0}")]
    LimitsReached(String),

    /// The operation would need to block (e.g. second writer on a WOULD_BLOCK
    /// resource); callers may retry.
    #[error("operation would block")]
    WouldBlock,

    /// Requested database does not exist in this environment.
    #[error("database {0} not found")]
    DatabaseNotFound(u16),
}

impl StorageError {
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn integrity_violated(msg: impl Into<String>) -> Self {
        Self::IntegrityViolated(msg.into())
    }

    pub fn blob_not_found(addr: PageAddress) -> Self {
        Self::BlobNotFound(addr.value())
    }
}
