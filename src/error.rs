//! Error types for the loader.

use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate.
///
/// Per-request I/O failures (open failure, read failure, truncation) are not
/// represented here; they travel in-band through [`crate::LoadStatus`] on the
/// completed entry. This enum covers configuration, setup, and usage errors
/// that halt the calling operation.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from region setup or the io_uring instance
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration parameter
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the offending parameter
        message: String,
    },

    /// Shared memory region errors: creation, attach, validation
    #[error("shared memory region error: {message}")]
    Region {
        /// Description of the region failure
        message: String,
    },

    /// Filepath longer than the per-slot path buffer
    #[error("filepath of {len} bytes exceeds the {cap}-byte path buffer")]
    PathTooLong {
        /// Length of the rejected path
        len: usize,
        /// Fixed path buffer capacity
        cap: usize,
    },

    /// Worker id outside `[0, n_workers)`
    #[error("worker id {id} out of range (region has {n_workers} workers)")]
    WorkerOutOfRange {
        /// Requested worker id
        id: u32,
        /// Number of workers the region was created with
        n_workers: u32,
    },

    /// CPU affinity errors when pinning the dispatch thread
    #[error("CPU affinity error: {0}")]
    CpuAffinity(#[from] nix::Error),

    /// The loader has shut down; no further completions will arrive
    #[error("loader shut down")]
    Aborted,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    pub fn region(message: impl Into<String>) -> Self {
        Self::Region { message: message.into() }
    }
}
