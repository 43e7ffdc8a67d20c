//! The storage backend contract.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use modproxy_types::{ModulePath, Result};

/// A stream over archive bytes. Backends that can stream from their medium
/// hand out a live reader instead of a buffered copy.
pub type ArchiveReader = Box<dyn AsyncRead + Send + Unpin>;

/// Wrap in-memory archive bytes as an [`ArchiveReader`].
pub fn archive_from_bytes(bytes: impl AsRef<[u8]> + Send + Unpin + 'static) -> ArchiveReader {
    Box::new(std::io::Cursor::new(bytes))
}

/// Drain an archive stream into memory.
pub async fn read_archive(mut reader: ArchiveReader) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Persistence for artifact sets keyed by `(module, version)`.
///
/// Contract, verified by the compliance suite:
/// - getters fail with `NotFound` for a key that was never saved
/// - `save` with identical content for an existing key is a no-op
/// - `save` with different content for an existing key fails with `Conflict`
///   and leaves the stored set untouched
/// - a set is visible only once all three artifacts are stored
/// - implementations are safe under concurrent calls without outside locking
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Every version saved for `module`; empty when nothing is stored.
    async fn list(&self, module: &ModulePath) -> Result<Vec<String>>;

    async fn info(&self, module: &ModulePath, version: &str) -> Result<Vec<u8>>;

    async fn manifest(&self, module: &ModulePath, version: &str) -> Result<Vec<u8>>;

    async fn archive(&self, module: &ModulePath, version: &str) -> Result<ArchiveReader>;

    /// Check for a stored set. Backends without a cheap native check get
    /// this default, which attempts a read.
    async fn exists(&self, module: &ModulePath, version: &str) -> Result<bool> {
        match self.info(module, version).await {
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
    ) -> Result<()>;
}
