//! Deduplicated upstream fetching.
//!
//! - [`Fetcher`]: the upstream collaborator that produces an artifact set
//! - [`Stash`]: runs at most one fetch per [`FetchKey`](modproxy_types::FetchKey)
//!   and stores the result before any caller is released
//! - [`synthesize_manifest`]: the stand-in manifest for modules without one

pub mod fetcher;
pub mod stash;

pub use fetcher::{synthesize_manifest, FetchedVersion, Fetcher};
pub use stash::{Stash, StashOptions};
