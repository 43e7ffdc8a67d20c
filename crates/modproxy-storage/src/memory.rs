//! In-memory backend.
//!
//! Artifact sets live in a map keyed by module path and version. Thread-safe
//! via an internal `RwLock`; nothing survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use modproxy_types::{FetchKey, ModulePath, ProxyError, Result};

use crate::backend::{archive_from_bytes, read_archive, ArchiveReader, Backend};

#[derive(Debug, PartialEq, Eq)]
struct StoredVersion {
    manifest: Arc<[u8]>,
    archive: Arc<[u8]>,
    info: Arc<[u8]>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    /// module -> version -> artifact set
    modules: RwLock<HashMap<ModulePath, BTreeMap<String, Arc<StoredVersion>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifact sets across all modules.
    pub fn len(&self) -> usize {
        self.modules.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything (test isolation).
    pub fn clear(&self) {
        self.modules.write().clear();
    }

    fn get(&self, module: &ModulePath, version: &str) -> Result<Arc<StoredVersion>> {
        self.modules
            .read()
            .get(module)
            .and_then(|versions| versions.get(version))
            .cloned()
            .ok_or_else(|| ProxyError::not_found(FetchKey::new(module.clone(), version)))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, module: &ModulePath) -> Result<Vec<String>> {
        Ok(self
            .modules
            .read()
            .get(module)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn info(&self, module: &ModulePath, version: &str) -> Result<Vec<u8>> {
        Ok(self.get(module, version)?.info.to_vec())
    }

    async fn manifest(&self, module: &ModulePath, version: &str) -> Result<Vec<u8>> {
        Ok(self.get(module, version)?.manifest.to_vec())
    }

    async fn archive(&self, module: &ModulePath, version: &str) -> Result<ArchiveReader> {
        let stored = self.get(module, version)?;
        Ok(archive_from_bytes(Arc::clone(&stored.archive)))
    }

    async fn exists(&self, module: &ModulePath, version: &str) -> Result<bool> {
        Ok(self
            .modules
            .read()
            .get(module)
            .is_some_and(|versions| versions.contains_key(version)))
    }

    async fn save(
        &self,
        module: &ModulePath,
        version: &str,
        manifest: &[u8],
        archive: ArchiveReader,
        info: &[u8],
    ) -> Result<()> {
        let key = FetchKey::new(module.clone(), version);
        // Drain the stream before taking the lock.
        let archive = read_archive(archive)
            .await
            .map_err(|e| ProxyError::backend(format!("failed to read archive for {key}: {e}")))?;
        let incoming = StoredVersion {
            manifest: Arc::from(manifest),
            archive: Arc::from(archive),
            info: Arc::from(info),
        };

        let mut modules = self.modules.write();
        let versions = modules.entry(module.clone()).or_default();
        match versions.get(version) {
            Some(existing) if **existing == incoming => Ok(()),
            Some(_) => Err(ProxyError::conflict(key)),
            None => {
                versions.insert(version.to_string(), Arc::new(incoming));
                Ok(())
            }
        }
    }
}
