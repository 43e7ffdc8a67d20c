//! Upstream sources for the proxy.
//!
//! Both types implement [`Fetcher`](modproxy_stash::Fetcher) and
//! [`Lister`](modproxy_protocol::Lister):
//!
//! - [`HttpUpstream`] - another module proxy reached over HTTP
//! - [`DirUpstream`] - a mirror directory on local disk, which may hold
//!   source trees that are packed into archives on demand

pub mod archive;
pub mod dir;
pub mod http;

pub use archive::pack_source_tree;
pub use dir::DirUpstream;
pub use http::HttpUpstream;
