//! Behavioural suite every [`Backend`] must pass.
//!
//! Backends are interchangeable only if they agree on one behaviour, so each
//! implementation runs this suite from its own tests:
//!
//! ```ignore
//! let backend = Arc::new(MemoryBackend::new());
//! let clear = { let b = backend.clone(); move || { b.clear(); Ok(()) } };
//! compliance::run_tests(backend, clear).await;
//! ```
//!
//! `clear` must reset the backend to empty; it runs before every check.

use std::sync::Arc;

use modproxy_types::{ErrorKind, ModulePath, Result};

use crate::backend::{archive_from_bytes, read_archive, ArchiveReader, Backend};

const MODULE: &str = "example.org/compliance";
const VERSION: &str = "v1.0.0";

fn module(path: &str) -> ModulePath {
    ModulePath::parse(path).expect("compliance module paths are valid")
}

fn manifest_for(module: &str) -> Vec<u8> {
    format!("module {module}\n").into_bytes()
}

fn info_for(version: &str) -> Vec<u8> {
    format!(r#"{{"Version":"{version}","Time":"2018-08-03T17:16:00Z"}}"#).into_bytes()
}

fn archive_for(module: &str, version: &str) -> Vec<u8> {
    format!("{module}@{version} archive").into_bytes()
}

async fn save(backend: &dyn Backend, m: &str, v: &str) -> Result<()> {
    backend
        .save(
            &module(m),
            v,
            &manifest_for(m),
            archive_from_bytes(archive_for(m, v)),
            &info_for(v),
        )
        .await
}

async fn read_all(reader: ArchiveReader) -> Vec<u8> {
    read_archive(reader).await.expect("archive stream is readable")
}

fn expect_kind<T>(result: Result<T>, kind: ErrorKind, what: &str) {
    match result {
        Ok(_) => panic!("{what}: expected {kind:?}, got Ok"),
        Err(e) => assert_eq!(e.kind(), kind, "{what}: unexpected error {e}"),
    }
}

/// Run every check in order, clearing the backend before each one.
pub async fn run_tests<F>(backend: Arc<dyn Backend>, clear: F)
where
    F: Fn() -> Result<()>,
{
    clear().expect("clear backend");
    round_trip(backend.as_ref()).await;
    clear().expect("clear backend");
    not_found(backend.as_ref()).await;
    clear().expect("clear backend");
    exists_before_and_after_save(backend.as_ref()).await;
    clear().expect("clear backend");
    idempotent_resave(backend.as_ref()).await;
    clear().expect("clear backend");
    conflicting_resave(backend.as_ref()).await;
    clear().expect("clear backend");
    list_versions(backend.as_ref()).await;
    clear().expect("clear backend");
    large_archive(backend.as_ref()).await;
    clear().expect("clear backend");
    concurrent_access(Arc::clone(&backend)).await;
    clear().expect("clear backend");
}

/// Saved bytes come back unchanged from every getter.
pub async fn round_trip(backend: &dyn Backend) {
    let m = module(MODULE);
    save(backend, MODULE, VERSION).await.expect("save");

    assert_eq!(backend.info(&m, VERSION).await.expect("info"), info_for(VERSION));
    assert_eq!(
        backend.manifest(&m, VERSION).await.expect("manifest"),
        manifest_for(MODULE)
    );
    let archive = read_all(backend.archive(&m, VERSION).await.expect("archive")).await;
    assert_eq!(archive, archive_for(MODULE, VERSION));

    // Reads are repeatable.
    let again = read_all(backend.archive(&m, VERSION).await.expect("archive")).await;
    assert_eq!(again, archive);
}

/// Unknown keys fail with `NotFound` from every getter.
pub async fn not_found(backend: &dyn Backend) {
    let m = module(MODULE);
    expect_kind(backend.info(&m, VERSION).await, ErrorKind::NotFound, "info");
    expect_kind(
        backend.manifest(&m, VERSION).await,
        ErrorKind::NotFound,
        "manifest",
    );
    expect_kind(
        backend.archive(&m, VERSION).await,
        ErrorKind::NotFound,
        "archive",
    );

    // A stored neighbour does not make the key visible.
    save(backend, MODULE, "v0.9.0").await.expect("save");
    expect_kind(backend.info(&m, VERSION).await, ErrorKind::NotFound, "info");
}

pub async fn exists_before_and_after_save(backend: &dyn Backend) {
    let m = module(MODULE);
    assert!(!backend.exists(&m, VERSION).await.expect("exists"));
    save(backend, MODULE, VERSION).await.expect("save");
    assert!(backend.exists(&m, VERSION).await.expect("exists"));
    assert!(!backend.exists(&m, "v1.0.1").await.expect("exists"));
    assert!(!backend
        .exists(&module("example.org/other"), VERSION)
        .await
        .expect("exists"));
}

/// Saving identical content twice succeeds and changes nothing.
pub async fn idempotent_resave(backend: &dyn Backend) {
    let m = module(MODULE);
    save(backend, MODULE, VERSION).await.expect("first save");
    save(backend, MODULE, VERSION).await.expect("identical re-save");

    assert_eq!(backend.list(&m).await.expect("list"), vec![VERSION.to_string()]);
    assert_eq!(backend.info(&m, VERSION).await.expect("info"), info_for(VERSION));
}

/// Different content under an existing key is a conflict and is not written.
pub async fn conflicting_resave(backend: &dyn Backend) {
    let m = module(MODULE);
    save(backend, MODULE, VERSION).await.expect("first save");

    let different_archive = backend
        .save(
            &m,
            VERSION,
            &manifest_for(MODULE),
            archive_from_bytes(b"tampered".to_vec()),
            &info_for(VERSION),
        )
        .await;
    expect_kind(different_archive, ErrorKind::Conflict, "archive conflict");

    let different_manifest = backend
        .save(
            &m,
            VERSION,
            b"module example.org/elsewhere\n",
            archive_from_bytes(archive_for(MODULE, VERSION)),
            &info_for(VERSION),
        )
        .await;
    expect_kind(different_manifest, ErrorKind::Conflict, "manifest conflict");

    assert_eq!(
        backend.manifest(&m, VERSION).await.expect("manifest"),
        manifest_for(MODULE)
    );
    let archive = read_all(backend.archive(&m, VERSION).await.expect("archive")).await;
    assert_eq!(archive, archive_for(MODULE, VERSION));
}

/// `list` returns exactly the versions of the requested module.
pub async fn list_versions(backend: &dyn Backend) {
    let m = module(MODULE);
    assert!(backend.list(&m).await.expect("list").is_empty());

    for v in ["v0.0.1", "v0.0.2", "v0.0.3"] {
        save(backend, MODULE, v).await.expect("save");
    }
    save(backend, "example.org/compliance/sub", "v9.9.9")
        .await
        .expect("save nested module");
    save(backend, "example.org/other", "v1.0.0")
        .await
        .expect("save other module");

    let mut versions = backend.list(&m).await.expect("list");
    versions.sort();
    assert_eq!(versions, vec!["v0.0.1", "v0.0.2", "v0.0.3"]);
    assert!(backend
        .list(&module("example.org/nothing-here"))
        .await
        .expect("list")
        .is_empty());
}

/// Archives larger than any internal buffer survive intact.
pub async fn large_archive(backend: &dyn Backend) {
    let m = module(MODULE);
    let big: Vec<u8> = (0..(1 << 20) + 17).map(|i| (i % 251) as u8).collect();
    backend
        .save(
            &m,
            VERSION,
            &manifest_for(MODULE),
            archive_from_bytes(big.clone()),
            &info_for(VERSION),
        )
        .await
        .expect("save");
    let archive = read_all(backend.archive(&m, VERSION).await.expect("archive")).await;
    assert_eq!(archive.len(), big.len());
    assert!(archive == big, "large archive corrupted");
}

/// Writers, readers and listers run in parallel without errors; readers only
/// ever observe complete sets.
pub async fn concurrent_access(backend: Arc<dyn Backend>) {
    const WRITERS: usize = 16;
    let m = module(MODULE);
    let versions: Vec<String> = (0..WRITERS).map(|i| format!("v1.0.{i}")).collect();

    let mut tasks = Vec::new();
    for v in &versions {
        let backend = Arc::clone(&backend);
        let v = v.clone();
        tasks.push(tokio::spawn(async move {
            save(backend.as_ref(), MODULE, &v).await.expect("concurrent save");
            // Duplicate writer racing the first one.
            save(backend.as_ref(), MODULE, &v).await.expect("concurrent re-save");
        }));
    }
    for _ in 0..WRITERS {
        let backend = Arc::clone(&backend);
        let m = m.clone();
        let versions = versions.clone();
        tasks.push(tokio::spawn(async move {
            for v in backend.list(&m).await.expect("concurrent list") {
                assert!(versions.contains(&v), "listed unknown version {v}");
                let info = backend.info(&m, &v).await.expect("listed version readable");
                assert_eq!(info, info_for(&v));
            }
            for v in &versions {
                match backend.manifest(&m, v).await {
                    Ok(manifest) => assert_eq!(manifest, manifest_for(MODULE)),
                    Err(e) => assert_eq!(e.kind(), ErrorKind::NotFound, "{e}"),
                }
            }
        }));
    }
    for task in tasks {
        task.await.expect("task panicked");
    }

    let mut listed = backend.list(&m).await.expect("list");
    listed.sort();
    let mut expected = versions;
    expected.sort();
    assert_eq!(listed, expected);
}
