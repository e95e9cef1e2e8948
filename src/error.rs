//! Errors surfaced from pool construction.
//!
//! Only resource acquisition is fallible. Contract violations (nested
//! parallel sections, unbalanced profiler logs) are programming errors and
//! panic instead of returning an error.

use thiserror::Error;

/// Result alias for pool construction.
pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Error, Debug)]
pub enum PoolError {
    /// The operating system refused to create a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The supplied options are inconsistent.
    #[error("invalid pool options: {0}")]
    InvalidOptions(String),
}
