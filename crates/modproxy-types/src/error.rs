//! Error kinds surfaced by storage, stash and protocol operations.
//!
//! `ProxyError` is `Clone` because one upstream fetch outcome is handed to
//! every caller that joined it.

use std::fmt::Display;
use std::time::Duration;

/// Convenience alias used across the workspace.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Coarse classification of a [`ProxyError`], used by front ends to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidModule,
    Upstream,
    Conflict,
    BackendUnavailable,
    Timeout,
}

impl ErrorKind {
    /// HTTP status a transport layer should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidModule => 400,
            ErrorKind::Upstream => 502,
            ErrorKind::Conflict => 409,
            ErrorKind::BackendUnavailable => 503,
            ErrorKind::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    /// The key was never saved, or upstream has no such module/version.
    #[error("{what}: not found")]
    NotFound { what: String },

    /// Malformed module path or version, or a path below a module root.
    #[error("invalid module {module}: {reason}")]
    InvalidModule { module: String, reason: String },

    /// The fetcher or lister failed. Never cached.
    #[error("upstream request for {target} failed: {message}")]
    Upstream { target: String, message: String },

    /// `save` was called with different content for an existing key.
    #[error("conflicting content for {key}")]
    Conflict { key: String },

    #[error("storage backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl ProxyError {
    pub fn not_found(what: impl Display) -> Self {
        ProxyError::NotFound {
            what: what.to_string(),
        }
    }

    pub fn invalid_module(module: impl Display, reason: impl Display) -> Self {
        ProxyError::InvalidModule {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn upstream(target: impl Display, message: impl Display) -> Self {
        ProxyError::Upstream {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    pub fn conflict(key: impl Display) -> Self {
        ProxyError::Conflict {
            key: key.to_string(),
        }
    }

    pub fn backend(message: impl Display) -> Self {
        ProxyError::BackendUnavailable {
            message: message.to_string(),
        }
    }

    pub fn timeout(operation: impl Display, after: Duration) -> Self {
        ProxyError::Timeout {
            operation: operation.to_string(),
            after,
        }
    }

    /// Map a filesystem error: a missing file is `NotFound`, anything else
    /// means the backend cannot be used.
    pub fn from_io(what: impl Display, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(what)
        } else {
            Self::backend(format!("{what}: {err}"))
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::NotFound { .. } => ErrorKind::NotFound,
            ProxyError::InvalidModule { .. } => ErrorKind::InvalidModule,
            ProxyError::Upstream { .. } => ErrorKind::Upstream,
            ProxyError::Conflict { .. } => ErrorKind::Conflict,
            ProxyError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            ProxyError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
