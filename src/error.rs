//! Error types for Stratum.

use thiserror::Error;

/// Result type alias using Stratum's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Stratum operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An allocator or its backing heap is exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// A null pointer was freed, or an offset outside the allocator.
    #[error("invalid free: {0}")]
    InvalidFree(String),

    /// A shared pointer was resolved against an allocator that does not
    /// contain it.
    #[error("pointer does not belong to this allocator")]
    PointerNotInAllocator,

    /// OS-level mapping failed while creating a backend.
    #[error("backend creation failed: {0}")]
    BackendCreateFailed(String),

    /// OS-level mapping failed while attaching to a backend.
    #[error("backend attach failed: {0}")]
    BackendAttachFailed(String),

    /// A fixed-capacity queue rejected a push.
    #[error("queue is full")]
    QueueFull,

    /// A non-blocking pop found the queue empty.
    #[error("queue is empty")]
    QueueEmpty,

    /// I/O error from the transaction log.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
