//! End-to-end resolution from a mirror directory into the filesystem backend.

use std::path::Path;
use std::sync::Arc;

use modproxy_protocol::Protocol;
use modproxy_storage::{read_archive, FsBackend};
use modproxy_types::{ErrorKind, RevInfo};
use modproxy_upstream::DirUpstream;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn mirror() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    for v in ["v0.0.1", "v0.0.2", "v0.0.3"] {
        write(
            root,
            &format!("example.org/foo/@v/{v}.info"),
            &format!(r#"{{"Version":"{v}","Time":"2018-08-03T03:45:19Z"}}"#),
        );
        write(root, &format!("example.org/foo/@v/{v}/go.mod"), "module example.org/foo\n");
        write(root, &format!("example.org/foo/@v/{v}/foo.go"), "package foo\n");
    }
    write(
        root,
        "example.org/bar/@v/head.json",
        r#"{"id":"abc1234","time":"2018-08-03T17:14:26Z"}"#,
    );
    dir
}

#[tokio::test]
async fn test_mirror_resolves_through_protocol() {
    let mirror = mirror();
    let cache = TempDir::new().unwrap();
    let upstream = Arc::new(DirUpstream::new(mirror.path()));
    let proxy = Protocol::new(
        Arc::new(FsBackend::new(cache.path()).unwrap()),
        upstream.clone(),
        upstream,
    );

    assert_eq!(
        proxy.list("example.org/foo").await.unwrap(),
        ["v0.0.1", "v0.0.2", "v0.0.3"]
    );
    assert_eq!(proxy.latest("example.org/foo").await.unwrap().version, "v0.0.3");
    // Resolving latest stores nothing.
    assert!(!cache.path().join("example.org").exists());

    let latest = proxy.latest("example.org/bar").await.unwrap();
    assert_eq!(latest.version, "v0.0.0-20180803171426-abc1234");

    let archive = read_archive(proxy.archive("example.org/foo", "v0.0.2").await.unwrap())
        .await
        .unwrap();
    let zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
    assert!(zip.file_names().all(|name| name.starts_with("foo@v0.0.2/")));

    // Removing the mirror does not affect what is already cached.
    drop(mirror);
    let info = proxy.info("example.org/foo", "v0.0.2").await.unwrap();
    assert_eq!(RevInfo::from_json(&info).unwrap().version, "v0.0.2");
    assert_eq!(
        proxy.manifest("example.org/foo", "v0.0.2").await.unwrap(),
        b"module example.org/foo\n"
    );
}

#[tokio::test]
async fn test_mirror_sub_directory_is_invalid() {
    let mirror = mirror();
    let upstream = Arc::new(DirUpstream::new(mirror.path()));
    let proxy = Protocol::new(
        Arc::new(modproxy_storage::MemoryBackend::new()),
        upstream.clone(),
        upstream,
    );

    let err = proxy.list("example.org/foo/sub").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidModule);
    let err = proxy.info("example.org/foo/sub", "v0.0.1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidModule);
}
