//! The module proxy protocol.
//!
//! [`Protocol`] answers list / latest / info / manifest / archive requests.
//! Stored artifact sets are served directly; misses go through the
//! [`Stash`](modproxy_stash::Stash) so each version is fetched from upstream
//! at most once at a time. Version listings and the default-branch head come
//! from a [`Lister`].

pub mod lister;
pub mod protocol;

pub use lister::Lister;
pub use protocol::{merge_versions, Protocol, ProtocolOptions};
