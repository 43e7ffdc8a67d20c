//! modproxy: a caching module proxy.
//!
//! The workspace crates hold the protocol machinery:
//!
//! - `modproxy-types`: module paths, versions, revision info, errors
//! - `modproxy-storage`: the `Backend` contract with memory and disk engines
//! - `modproxy-stash`: deduplicated upstream fetching
//! - `modproxy-protocol`: list / latest / info / mod / zip
//! - `modproxy-upstream`: HTTP proxy and local mirror upstreams
//!
//! This crate adds what a deployment needs on top: layered configuration
//! ([`config`]) and per-module Include/Exclude/Direct policy ([`filter`]).

pub mod config;
pub mod filter;

pub use config::{ProxyConfig, StorageKind, UpstreamSource};
pub use filter::{redirect_url, FilterRule, ModuleFilter};

pub use modproxy_protocol::Protocol;
pub use modproxy_storage::{CacheMetrics, MetricsSnapshot};
pub use modproxy_types::{ErrorKind, ProxyError};
