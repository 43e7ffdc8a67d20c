//! A mirror directory on local disk used as upstream.
//!
//! ```text
//! <root>/<escaped module>/@v/list           tags, one per line (optional)
//! <root>/<escaped module>/@v/head.json      {"id": .., "time": ..}
//! <root>/<escaped module>/@v/<escaped v>.info
//! <root>/<escaped module>/@v/<escaped v>.mod        (optional)
//! <root>/<escaped module>/@v/<escaped v>.zip        or
//! <root>/<escaped module>/@v/<escaped v>/           a source tree, zipped on demand
//! ```
//!
//! A module is known when its `@v` directory exists. Without a `list` file,
//! tags are discovered from `.info` files and source-tree directories.
//! Versions are case-escaped the same way the disk backend stores them.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use modproxy_protocol::Lister;
use modproxy_stash::{FetchedVersion, Fetcher};
use modproxy_storage::archive_from_bytes;
use modproxy_storage::paths::{version_dir, versions_dir};
use modproxy_types::module::unescape_case;
use modproxy_types::{FetchKey, ModulePath, ProxyError, Result, RevInfo, Revision, Version};

use crate::archive::pack_source_tree;
use crate::http::parse_list;

const LIST_FILE: &str = "list";
const HEAD_FILE: &str = "head.json";
/// Manifest looked up inside a source tree when no `.mod` file exists.
const TREE_MANIFEST: &str = "go.mod";

#[derive(Debug, Clone)]
pub struct DirUpstream {
    root: PathBuf,
}

impl DirUpstream {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The module's `@v` directory. Fails with `InvalidModule` when an
    /// ancestor is a module root and `NotFound` otherwise.
    async fn module_dir(&self, module: &ModulePath) -> Result<PathBuf> {
        let dir = versions_dir(&self.root, module);
        if is_dir(&dir).await {
            return Ok(dir);
        }
        for ancestor in module.ancestors() {
            if is_dir(&versions_dir(&self.root, &ancestor)).await {
                return Err(ProxyError::invalid_module(
                    module,
                    format!("sub-directory of module {ancestor}"),
                ));
            }
        }
        Err(ProxyError::not_found(module))
    }

    /// Tags discovered from `.info` files and source trees.
    async fn scan_versions(dir: &Path) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| mirror_error(dir, e))?;
        let mut versions = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| mirror_error(dir, e))? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let escaped = match name.strip_suffix(".info") {
                Some(version) => version,
                None if is_dir(&entry.path()).await => name.as_str(),
                None => continue,
            };
            match unescape_case(escaped) {
                Some(version) if Version::parse(&version).is_ok() => {
                    versions.insert(version);
                }
                _ => {}
            }
        }
        Ok(versions.into_iter().collect())
    }

    /// The version's source-tree path; its files are siblings named
    /// `<escaped v>.<ext>`.
    async fn version_base(&self, module: &ModulePath, version: &str) -> Result<PathBuf> {
        self.module_dir(module).await?;
        version_dir(&self.root, module, version)
    }

    /// The `.info` file, or for an untagged revision with a source tree, info
    /// built from the commit time carried in the version.
    async fn read_info(&self, base: &Path, module: &ModulePath, version: &str) -> Result<Vec<u8>> {
        if let Some(info) = read_optional(&sibling(base, "info")).await? {
            return Ok(info);
        }
        match Version::parse(version)?.pseudo_time() {
            Some(committed) if is_dir(base).await => RevInfo::new(version, committed).to_json(),
            _ => Err(ProxyError::not_found(FetchKey::new(module.clone(), version))),
        }
    }
}

#[async_trait]
impl Lister for DirUpstream {
    async fn list(&self, module: &ModulePath) -> Result<Vec<String>> {
        let dir = self.module_dir(module).await?;
        match read_optional(&dir.join(LIST_FILE)).await? {
            Some(body) => Ok(parse_list(&body)),
            None => Self::scan_versions(&dir).await,
        }
    }

    async fn head(&self, module: &ModulePath) -> Result<Revision> {
        let dir = self.module_dir(module).await?;
        let path = dir.join(HEAD_FILE);
        let body = read_optional(&path)
            .await?
            .ok_or_else(|| ProxyError::not_found(format!("{module} default branch")))?;
        serde_json::from_slice(&body)
            .map_err(|e| ProxyError::upstream(path.display(), format!("malformed head: {e}")))
    }

    async fn info(&self, module: &ModulePath, version: &str) -> Result<RevInfo> {
        let base = self.version_base(module, version).await?;
        RevInfo::from_json(&self.read_info(&base, module, version).await?)
    }
}

#[async_trait]
impl Fetcher for DirUpstream {
    async fn fetch(&self, module: &ModulePath, version: &str) -> Result<FetchedVersion> {
        let key = FetchKey::new(module.clone(), version);
        let base = self.version_base(module, version).await?;
        let info = self.read_info(&base, module, version).await?;
        let tree = is_dir(&base).await.then_some(base.as_path());

        let manifest = match read_optional(&sibling(&base, "mod")).await? {
            Some(manifest) => Some(manifest),
            None => match tree {
                Some(tree) => read_optional(&tree.join(TREE_MANIFEST)).await?,
                None => None,
            },
        };

        let archive = match (read_optional(&sibling(&base, "zip")).await?, tree) {
            (Some(zip), _) => zip,
            (None, Some(tree)) => {
                let prefix = format!("{}@{version}", module.last_element());
                debug!(%key, tree = %tree.display(), "packing source tree");
                let tree = tree.to_path_buf();
                tokio::task::spawn_blocking(move || pack_source_tree(&tree, &prefix))
                    .await
                    .map_err(|e| ProxyError::upstream(&key, format!("packing task failed: {e}")))?
                    .map_err(|e| ProxyError::upstream(&key, format!("failed to pack: {e}")))?
            }
            (None, None) => return Err(ProxyError::not_found(format!("archive for {key}"))),
        };

        Ok(FetchedVersion {
            info,
            manifest,
            archive: archive_from_bytes(archive),
        })
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn sibling(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(ext);
    base.with_file_name(name)
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(mirror_error(path, e)),
    }
}

fn mirror_error(path: &Path, err: std::io::Error) -> ProxyError {
    ProxyError::upstream(path.display(), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modproxy_storage::read_archive;
    use tempfile::TempDir;

    fn module(path: &str) -> ModulePath {
        ModulePath::parse(path).unwrap()
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_list_prefers_list_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "example.org/foo/@v/list", "v0.0.2\nv0.0.1\n");
        write(dir.path(), "example.org/foo/@v/v0.0.9.info", "{}");
        let upstream = DirUpstream::new(dir.path());

        let tags = upstream.list(&module("example.org/foo")).await.unwrap();
        assert_eq!(tags, ["v0.0.2", "v0.0.1"]);
    }

    #[tokio::test]
    async fn test_list_scans_without_list_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "example.org/foo/@v/v0.0.1.info", "{}");
        write(dir.path(), "example.org/foo/@v/v0.0.2/foo.go", "package foo\n");
        write(dir.path(), "example.org/foo/@v/head.json", "{}");
        let upstream = DirUpstream::new(dir.path());

        let tags = upstream.list(&module("example.org/foo")).await.unwrap();
        assert_eq!(tags, ["v0.0.1", "v0.0.2"]);
    }

    #[tokio::test]
    async fn test_sub_directory_and_unknown_module() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "example.org/foo/@v/list", "v0.0.1\n");
        let upstream = DirUpstream::new(dir.path());

        let err = upstream.list(&module("example.org/foo/types")).await.unwrap_err();
        assert_eq!(err.kind(), modproxy_types::ErrorKind::InvalidModule);
        let err = upstream.list(&module("example.org/nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_head_reads_revision() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "example.org/bar/@v/head.json",
            r#"{"id":"abc1234","time":"2018-08-03T17:14:26Z"}"#,
        );
        let upstream = DirUpstream::new(dir.path());

        let head = upstream.head(&module("example.org/bar")).await.unwrap();
        assert_eq!(head.id, "abc1234");
    }

    #[tokio::test]
    async fn test_fetch_packs_source_tree() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "example.org/foo/@v/v0.0.1.info",
            r#"{"Version":"v0.0.1","Time":"2018-08-03T03:45:19Z"}"#,
        );
        write(dir.path(), "example.org/foo/@v/v0.0.1/go.mod", "module example.org/foo\n");
        write(dir.path(), "example.org/foo/@v/v0.0.1/foo.go", "package foo\n");
        let upstream = DirUpstream::new(dir.path());

        let fetched = upstream
            .fetch(&module("example.org/foo"), "v0.0.1")
            .await
            .unwrap();
        assert_eq!(fetched.manifest.as_deref(), Some(&b"module example.org/foo\n"[..]));
        let archive = read_archive(fetched.archive).await.unwrap();
        let zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        let mut names: Vec<&str> = zip.file_names().collect();
        names.sort();
        assert_eq!(names, ["foo@v0.0.1/foo.go", "foo@v0.0.1/go.mod"]);
    }

    #[tokio::test]
    async fn test_fetch_pseudo_version_without_info() {
        let dir = TempDir::new().unwrap();
        let pseudo = "v0.0.0-20180803171426-abc1234";
        write(dir.path(), &format!("example.org/bar/@v/{pseudo}/bar.go"), "package bar\n");
        let upstream = DirUpstream::new(dir.path());

        let fetched = upstream.fetch(&module("example.org/bar"), pseudo).await.unwrap();
        let info = RevInfo::from_json(&fetched.info).unwrap();
        assert_eq!(info.version, pseudo);
        assert_eq!(info.time.to_rfc3339(), "2018-08-03T17:14:26+00:00");
        assert!(fetched.manifest.is_none());
    }

    #[tokio::test]
    async fn test_fetch_unknown_version_is_not_found() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "example.org/foo/@v/list", "v0.0.1\n");
        let upstream = DirUpstream::new(dir.path());

        let err = upstream
            .fetch(&module("example.org/foo"), "v9.9.9")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_info_reads_only_the_info_file() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "example.org/foo/@v/v0.0.1.info",
            r#"{"Version":"v0.0.1","Time":"2018-08-03T03:45:19Z"}"#,
        );
        let upstream = DirUpstream::new(dir.path());
        let m = module("example.org/foo");

        let info = upstream.info(&m, "v0.0.1").await.unwrap();
        assert_eq!(info.version, "v0.0.1");
        // No archive or tree exists, so a full fetch would fail.
        assert!(upstream.fetch(&m, "v0.0.1").await.unwrap_err().is_not_found());
        assert!(upstream.info(&m, "v0.0.2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_upper_case_versions_are_escaped() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "example.org/foo/@v/v1.0.0-!r!c1.info",
            r#"{"Version":"v1.0.0-RC1","Time":"2018-08-03T03:45:19Z"}"#,
        );
        write(dir.path(), "example.org/foo/@v/v1.0.0-!r!c1.zip", "zip");
        let upstream = DirUpstream::new(dir.path());
        let m = module("example.org/foo");

        assert_eq!(upstream.list(&m).await.unwrap(), ["v1.0.0-RC1"]);
        let fetched = upstream.fetch(&m, "v1.0.0-RC1").await.unwrap();
        assert_eq!(read_archive(fetched.archive).await.unwrap(), b"zip");
        assert!(upstream.info(&m, "v1.0.0-rc1").await.unwrap_err().is_not_found());
    }
}
