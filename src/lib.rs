//! sluice - shared-memory asynchronous file loader
//!
//! A single loader process ingests filepath requests from many worker
//! processes over shared-memory rings, batches them into io_uring reads,
//! and hands completed file contents back through preallocated slots. The
//! target workload is bulk ingestion of many small-to-medium files
//! (training data, preprocessing pipelines) where per-process synchronous
//! reads leave the device queue shallow.
//!
//! ## Architecture
//!
//! - One named shared region holds all coordination state: per-worker
//!   submission/completion/free rings, slot metadata, and the pinned data
//!   buffers the kernel reads into.
//! - The loader's single dispatch thread harvests submissions, stages
//!   reads, submits them in batches, and publishes completions.
//! - Workers never block on submission; backpressure is an explicit
//!   `Ok(false)` once all their slots are in flight.
//!
//! ## Example
//!
//! ```no_run
//! use sluice::{Loader, LoaderConfig};
//!
//! let mut loader = Loader::new(LoaderConfig::new(1, 64)?)?;
//! let worker = loader.worker_context(0)?;
//! let control = loader.control();
//! std::thread::spawn(move || loader.become_loader());
//!
//! assert!(worker.request("/etc/hostname")?);
//! let entry = worker.wait_get()?;
//! println!("{}: {} bytes", entry.filepath().display(), entry.len());
//! entry.release();
//! control.shutdown();
//! # Ok::<(), sluice::Error>(())
//! ```

pub mod config;
pub mod constants;
pub mod cpu;
pub mod error;
pub mod layout;
pub mod loader;
pub mod ring;
pub mod sem;
pub mod shm;
pub mod slot;
pub mod worker;

// Re-export main components
pub use config::LoaderConfig;
pub use error::{Error, Result};
pub use loader::{Loader, LoaderControl};
pub use slot::{LoadStatus, SlotState};
pub use worker::{Entry, Worker};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
