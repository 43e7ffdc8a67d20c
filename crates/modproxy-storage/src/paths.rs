//! Path utilities for the filesystem layout.
//!
//! ```text
//! <root>/<escaped module>/@v/<escaped version>/manifest
//! <root>/<escaped module>/@v/<escaped version>/archive.zip
//! <root>/<escaped module>/@v/<escaped version>/info        (written last)
//! ```
//!
//! `@` never appears in a module path element, so a module's `@v` directory
//! cannot collide with a nested module such as `<module>/sub`.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use modproxy_types::module::escape_case;
use modproxy_types::{ModulePath, ProxyError};

pub const VERSIONS_DIR: &str = "@v";
pub const MANIFEST_FILE: &str = "manifest";
pub const ARCHIVE_FILE: &str = "archive.zip";
/// Committed last; its presence marks a complete artifact set.
pub const INFO_FILE: &str = "info";

/// Directory holding every stored version of `module`.
pub fn versions_dir(root: &Path, module: &ModulePath) -> PathBuf {
    let mut dir = root.to_path_buf();
    for elem in module.escaped().split('/') {
        dir.push(elem);
    }
    dir.join(VERSIONS_DIR)
}

/// Directory holding one artifact set. The version is case-escaped like
/// the module, so `v1.0.0-RC1` and `v1.0.0-rc1` never share a directory.
///
/// Versions are validated before they reach a backend, but a separator or a
/// relative component would escape the layout, so they are rejected here too.
pub fn version_dir(root: &Path, module: &ModulePath, version: &str) -> Result<PathBuf, ProxyError> {
    if version.is_empty()
        || version == "."
        || version == ".."
        || version.contains(['/', '\\'])
    {
        return Err(ProxyError::invalid_module(
            module,
            format!("version {version:?} cannot be stored"),
        ));
    }
    Ok(versions_dir(root, module).join(escape_case(version)))
}

/// Unique sibling path for a temporary write.
pub fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Ensure all parent directories exist for a path.
pub async fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Write a file atomically (write to a unique temp file, then rename).
pub async fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    ensure_parent_dirs(path).await?;
    let tmp = tmp_path(path);
    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;
    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    written
}
