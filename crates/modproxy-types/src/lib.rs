//! Shared types for the modproxy workspace.
//!
//! This crate provides the vocabulary every other crate speaks:
//!
//! - [`ModulePath`] - validated, slash-delimited module identifiers
//! - [`Version`] - semantic versions and pseudo-versions with precedence ordering
//! - [`RevInfo`] / [`Revision`] - revision descriptors served as the Info artifact
//! - [`FetchKey`] - the `(module, version)` unit of caching and deduplication
//! - [`ProxyError`] / [`ErrorKind`] - the error kinds surfaced by the protocol

pub mod env_utils;
pub mod error;
pub mod module;
pub mod revinfo;
pub mod version;

pub use error::{ErrorKind, ProxyError, Result};
pub use module::{FetchKey, ModulePath};
pub use revinfo::{RevInfo, Revision};
pub use version::Version;
