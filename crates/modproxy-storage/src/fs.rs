//! Filesystem-backed module storage.
//!
//! Each artifact set lives in its own directory (see [`crate::paths`]).
//! Artifacts are written to unique temp files and renamed into place, the
//! archive is streamed to disk while being hashed, and the info file is
//! committed last so readers never observe a partial set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use modproxy_types::module::unescape_case;
use modproxy_types::{FetchKey, ModulePath, ProxyError, Result};

use crate::backend::{ArchiveReader, Backend};
use crate::paths::{
    atomic_write, ensure_parent_dirs, tmp_path, version_dir, versions_dir, ARCHIVE_FILE, INFO_FILE,
    MANIFEST_FILE,
};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Filesystem backend rooted at a directory.
pub struct FsBackend {
    root: Arc<Path>,
    save_locks: SaveLocks,
}

impl FsBackend {
    /// Create a backend, creating the root directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| ProxyError::backend(format!("failed to create {}: {e}", root.display())))?;
        Ok(Self {
            root: Arc::from(root),
            save_locks: SaveLocks::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove every stored artifact set (test isolation).
    pub fn clear(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| ProxyError::from_io(self.root.display(), &e))?;
        for entry in entries {
            let path = entry
                .map_err(|e| ProxyError::from_io(self.root.display(), &e))?
                .path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(|e| ProxyError::from_io(path.display(), &e))?;
        }
        Ok(())
    }

    /// Directory of a committed artifact set, or `NotFound`.
    async fn committed_dir(&self, module: &ModulePath, version: &str) -> Result<PathBuf> {
        let dir = version_dir(&self.root, module, version)?;
        let key = FetchKey::new(module.clone(), version);
        match tokio::fs::try_exists(dir.join(INFO_FILE)).await {
            Ok(true) => Ok(dir),
            Ok(false) => Err(ProxyError::not_found(key)),
            Err(e) => Err(ProxyError::from_io(key, &e)),
        }
    }

    async fn read_artifact(
        &self,
        module: &ModulePath,
        version: &str,
        file: &str,
    ) -> Result<Vec<u8>> {
        let path = self.committed_dir(module, version).await?.join(file);
        tokio::fs::read(&path)
            .await
            .map_err(|e| ProxyError::from_io(path.display(), &e))
    }

    /// Compare an incoming set with the committed one under `dir`.
    async fn matches_stored(
        dir: &Path,
        manifest: &[u8],
        archive: ArchiveReader,
        info: &[u8],
    ) -> std::io::Result<bool> {
        let stored_manifest = tokio::fs::read(dir.join(MANIFEST_FILE)).await?;
        let stored_info = tokio::fs::read(dir.join(INFO_FILE)).await?;
        if stored_manifest != manifest || stored_info != info {
            return Ok(false);
        }
        let stored_archive = tokio::fs::File::open(dir.join(ARCHIVE_FILE)).await?;
        Ok(digest_stream(stored_archive).await? == digest_stream(archive).await?)
    }
}

#[async_trait]
impl Backend for FsBackend {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn list(&self, module: &ModulePath) -> Result<Vec<String>> {
        let dir = versions_dir(&self.root, module);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProxyError::from_io(dir.display(), &e)),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProxyError::from_io(dir.display(), &e))?
        {
            let Some(version) = entry.file_name().to_str().and_then(unescape_case) else {
                continue;
            };
            // Uncommitted sets are not listed.
            if matches!(tokio::fs::try_exists(entry.path().join(INFO_FILE)).await, Ok(true)) {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    async fn info(&self, module: &ModulePath, version: &str) -> Result<Vec<u8>> {
        self.read_artifact(module, version, INFO_FILE).await
    }

    async fn manifest(&self, module: &ModulePath, version: &str) -> Result<Vec<u8>> {
        self.read_artifact(module, version, MANIFEST_FILE).await
    }

    async fn archive(&self, module: &ModulePath, version: &str) -> Result<ArchiveReader> {
        let path = self.committed_dir(module, version).await?.join(ARCHIVE_FILE);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ProxyError::from_io(path.display(), &e))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, module: &ModulePath, version: &str) -> Result<bool> {
        match self.committed_dir(module, version).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
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
        let dir = version_dir(&self.root, module, version)?;
        let lock = self.save_locks.lock_for(&dir);
        let _guard = lock.lock().await;

        let committed = tokio::fs::try_exists(dir.join(INFO_FILE))
            .await
            .map_err(|e| ProxyError::from_io(dir.display(), &e))?;
        if committed {
            let same = Self::matches_stored(&dir, manifest, archive, info)
                .await
                .map_err(|e| ProxyError::backend(format!("failed to compare {key}: {e}")))?;
            return if same {
                debug!(%key, "artifact set already stored");
                Ok(())
            } else {
                Err(ProxyError::conflict(key))
            };
        }

        let write_err =
            |e: std::io::Error| ProxyError::backend(format!("failed to store {key}: {e}"));
        atomic_write(&dir.join(MANIFEST_FILE), manifest)
            .await
            .map_err(write_err)?;
        let digest = write_stream(&dir.join(ARCHIVE_FILE), archive)
            .await
            .map_err(write_err)?;
        atomic_write(&dir.join(INFO_FILE), info)
            .await
            .map_err(write_err)?;

        debug!(%key, archive_sha256 = %hex::encode(digest), "stored artifact set");
        Ok(())
    }
}

/// Stream `reader` into `path` through a temp file, returning the SHA-256
/// of the bytes written.
async fn write_stream(path: &Path, mut reader: ArchiveReader) -> std::io::Result<[u8; 32]> {
    ensure_parent_dirs(path).await?;
    let tmp = tmp_path(path);
    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok::<_, std::io::Error>(hasher.finalize().into())
    }
    .await;
    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    written
}

async fn digest_stream<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Per-directory save locks. Entries are weak so finished saves do not
/// accumulate.
#[derive(Default)]
struct SaveLocks {
    locks: parking_lot::Mutex<HashMap<PathBuf, Weak<tokio::sync::Mutex<()>>>>,
}

impl SaveLocks {
    fn lock_for(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(dir).and_then(Weak::upgrade) {
            return existing;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(dir.to_path_buf(), Arc::downgrade(&lock));
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::archive_from_bytes;
    use tempfile::TempDir;

    fn module(path: &str) -> ModulePath {
        ModulePath::parse(path).unwrap()
    }

    #[tokio::test]
    async fn test_uncommitted_set_is_invisible() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = FsBackend::new(temp_dir.path())?;
        let m = module("example.org/foo");

        // A crash after the manifest write leaves no info file behind.
        let dir = version_dir(backend.root(), &m, "v1.0.0")?;
        atomic_write(&dir.join(MANIFEST_FILE), b"module example.org/foo\n").await?;

        assert!(!backend.exists(&m, "v1.0.0").await?);
        assert!(backend.list(&m).await?.is_empty());
        assert!(backend.manifest(&m, "v1.0.0").await.unwrap_err().is_not_found());

        // The key can still be saved normally afterwards.
        backend
            .save(
                &m,
                "v1.0.0",
                b"module example.org/foo\n",
                archive_from_bytes(b"zip".to_vec()),
                b"{}",
            )
            .await?;
        assert_eq!(backend.list(&m).await?, vec!["v1.0.0"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_escaped_layout_on_disk() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = FsBackend::new(temp_dir.path())?;
        let m = module("github.com/Azure/sdk");
        backend
            .save(&m, "v0.1.0", b"m", archive_from_bytes(b"a".to_vec()), b"i")
            .await?;

        let dir = temp_dir.path().join("github.com/!azure/sdk/@v/v0.1.0");
        assert_eq!(std::fs::read(dir.join(INFO_FILE))?, b"i");
        assert_eq!(std::fs::read(dir.join(ARCHIVE_FILE))?, b"a");
        Ok(())
    }

    #[tokio::test]
    async fn test_versions_differing_in_case_stay_apart() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let backend = FsBackend::new(temp_dir.path())?;
        let m = module("example.org/foo");
        backend
            .save(&m, "v1.0.0-RC1", b"upper", archive_from_bytes(b"A".to_vec()), b"U")
            .await?;
        backend
            .save(&m, "v1.0.0-rc1", b"lower", archive_from_bytes(b"a".to_vec()), b"l")
            .await?;

        assert!(temp_dir.path().join("example.org/foo/@v/v1.0.0-!r!c1").is_dir());
        assert_eq!(backend.list(&m).await?, vec!["v1.0.0-RC1", "v1.0.0-rc1"]);
        assert_eq!(backend.manifest(&m, "v1.0.0-RC1").await?, b"upper");
        assert_eq!(backend.manifest(&m, "v1.0.0-rc1").await?, b"lower");
        Ok(())
    }
}
