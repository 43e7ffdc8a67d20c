use async_trait::async_trait;

use modproxy_storage::ArchiveReader;
use modproxy_types::{ModulePath, Result};

/// Artifacts for one module version as produced by upstream.
pub struct FetchedVersion {
    /// Serialized [`RevInfo`](modproxy_types::RevInfo).
    pub info: Vec<u8>,
    /// `None` when the module has no manifest of its own.
    pub manifest: Option<Vec<u8>>,
    pub archive: ArchiveReader,
}

impl std::fmt::Debug for FetchedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedVersion")
            .field("info_len", &self.info.len())
            .field("manifest_len", &self.manifest.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

/// Retrieves a single module version from upstream.
///
/// Any error is a failed attempt; the stash never caches it.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, module: &ModulePath, version: &str) -> Result<FetchedVersion>;
}

/// Minimal manifest declaring only the module path.
pub fn synthesize_manifest(module: &ModulePath) -> Vec<u8> {
    format!("module {module}\n").into_bytes()
}
