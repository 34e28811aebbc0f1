//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer. Disk I/O failures propagate
/// as plain `anyhow` errors from the disk manager; these variants cover
/// the conditions callers dispatch on.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool exhausted: all frames are pinned")]
    PoolExhausted,

    #[error("Out of memory: no page could be allocated during a structural change")]
    OutOfMemory,
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
