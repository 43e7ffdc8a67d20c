//! Storage backends for cached module artifacts.
//!
//! This crate provides:
//! - [`Backend`]: the contract every persistence engine implements
//! - [`MemoryBackend`]: map-backed storage for tests and ephemeral proxies
//! - [`FsBackend`]: filesystem storage with atomic, commit-last writes
//! - [`CacheMetrics`]: thread-safe counters for hits, fetches and failures
//! - `compliance` (feature `compliance`): the shared behavioural suite

pub mod backend;
pub mod fs;
pub mod memory;
pub mod metrics;
pub mod paths;

#[cfg(feature = "compliance")]
pub mod compliance;

pub use backend::{archive_from_bytes, read_archive, ArchiveReader, Backend};
pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use metrics::{CacheMetrics, MetricsSnapshot};
