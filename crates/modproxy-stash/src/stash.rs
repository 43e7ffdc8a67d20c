//! Single-flight fetching with save-before-release.
//!
//! The first caller for a key becomes the leader and starts the fetch on a
//! spawned task; later callers join the same shared future. The task stores
//! the artifact set before resolving, so every caller that sees `Ok` can read
//! the set back from the backend. Because the work lives on its own task,
//! dropping any caller (leader included) never strands the others.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use modproxy_storage::{Backend, CacheMetrics};
use modproxy_types::{FetchKey, ModulePath, ProxyError, Result};

use crate::fetcher::{synthesize_manifest, Fetcher};

type SharedFetch = Shared<BoxFuture<'static, Result<()>>>;

/// Behaviour switches for [`Stash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StashOptions {
    /// Store `module <path>` when upstream has no manifest. When off, such
    /// versions fail with `NotFound`.
    pub synthesize_missing_manifest: bool,
}

impl Default for StashOptions {
    fn default() -> Self {
        Self {
            synthesize_missing_manifest: true,
        }
    }
}

/// Deduplicates upstream fetches per [`FetchKey`]. Cheap to clone.
#[derive(Clone)]
pub struct Stash {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Arc<dyn Fetcher>,
    backend: Arc<dyn Backend>,
    options: StashOptions,
    metrics: CacheMetrics,
    /// Locked only to look up, insert or remove entries.
    inflight: Mutex<HashMap<FetchKey, SharedFetch>>,
}

impl Stash {
    pub fn new(fetcher: Arc<dyn Fetcher>, backend: Arc<dyn Backend>) -> Self {
        Self::with_options(fetcher, backend, StashOptions::default(), CacheMetrics::default())
    }

    pub fn with_options(
        fetcher: Arc<dyn Fetcher>,
        backend: Arc<dyn Backend>,
        options: StashOptions,
        metrics: CacheMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                backend,
                options,
                metrics,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    /// Ensure the artifact set for `module@version` is stored.
    ///
    /// Joins a running fetch for the same key if there is one. On `Ok` the
    /// set is durably stored; errors are shared by every joined caller and
    /// are not remembered.
    pub async fn fetch(&self, module: &ModulePath, version: &str) -> Result<()> {
        let key = FetchKey::new(module.clone(), version);
        let shared = {
            let mut inflight = self.inner.inflight.lock();
            match inflight.get(&key) {
                Some(existing) => {
                    self.inner.metrics.record_joined_fetch();
                    debug!(%key, "joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let fetch = Self::leader_future(Arc::clone(&self.inner), key.clone());
                    inflight.insert(key, fetch.clone());
                    fetch
                }
            }
        };
        shared.await
    }

    /// The shared future stored for a new key. The task is spawned on first
    /// poll, outside the registry lock.
    fn leader_future(inner: Arc<Inner>, key: FetchKey) -> SharedFetch {
        async move {
            let guard = InflightGuard {
                inner: Arc::clone(&inner),
                key: key.clone(),
            };
            let task_key = key.clone();
            let handle = tokio::spawn(async move {
                let _guard = guard;
                inner.run(&task_key).await
            });
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ProxyError::upstream(&key, format!("fetch task failed: {e}"))),
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    async fn run(&self, key: &FetchKey) -> Result<()> {
        let result = self.fetch_and_save(key).await;
        if let Err(e) = &result {
            self.metrics.record_failed_fetch();
            warn!(%key, error = %e, "fetch failed");
        }
        result
    }

    async fn fetch_and_save(&self, key: &FetchKey) -> Result<()> {
        let FetchKey { module, version } = key;

        // A caller arriving after a completed fetch finds the set stored.
        if self.backend.exists(module, version).await? {
            debug!(%key, "already stored, skipping upstream");
            return Ok(());
        }

        self.metrics.record_upstream_fetch();
        debug!(%key, "fetching from upstream");
        let fetched = self.fetcher.fetch(module, version).await?;

        let manifest = match fetched.manifest {
            Some(manifest) => manifest,
            None if self.options.synthesize_missing_manifest => {
                self.metrics.record_synthesized_manifest();
                debug!(%key, "synthesizing missing manifest");
                synthesize_manifest(module)
            }
            None => return Err(ProxyError::not_found(format!("manifest for {key}"))),
        };

        self.backend
            .save(module, version, &manifest, fetched.archive, &fetched.info)
            .await?;
        debug!(%key, backend = self.backend.name(), "saved artifact set");
        Ok(())
    }
}

/// Removes the registry entry when the fetch task ends, including by panic.
struct InflightGuard {
    inner: Arc<Inner>,
    key: FetchKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inner.inflight.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchedVersion;
    use async_trait::async_trait;
    use modproxy_storage::{archive_from_bytes, read_archive, ArchiveReader, MemoryBackend};
    use modproxy_types::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Counts calls; optionally blocks on a gate, fails the first N calls or
    /// omits the manifest.
    #[derive(Default)]
    struct TestFetcher {
        calls: AtomicUsize,
        failures_left: AtomicUsize,
        gate: Option<(ModulePath, Arc<Semaphore>)>,
        without_manifest: bool,
        panic: bool,
    }

    impl TestFetcher {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for TestFetcher {
        async fn fetch(&self, module: &ModulePath, version: &str) -> Result<FetchedVersion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((gated, gate)) = &self.gate {
                if gated == module {
                    let _permit = gate.acquire().await.expect("gate closed");
                }
            }
            if self.panic {
                panic!("fetcher exploded");
            }
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ProxyError::upstream(module, "connection reset"));
            }
            let manifest =
                (!self.without_manifest).then(|| format!("module {module}\n").into_bytes());
            Ok(FetchedVersion {
                info: format!(r#"{{"Version":"{version}","Time":"2018-08-03T17:16:00Z"}}"#)
                    .into_bytes(),
                manifest,
                archive: archive_from_bytes(format!("{module}@{version}").into_bytes()),
            })
        }
    }

    fn module(path: &str) -> ModulePath {
        ModulePath::parse(path).unwrap()
    }

    fn stash_with(fetcher: Arc<TestFetcher>) -> (Stash, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let stash = Stash::new(fetcher, backend.clone());
        (stash, backend)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_fetch() {
        let gate = Arc::new(Semaphore::new(0));
        let baz = module("example.org/baz");
        let fetcher = Arc::new(TestFetcher {
            gate: Some((baz.clone(), gate.clone())),
            ..Default::default()
        });
        let (stash, backend) = stash_with(fetcher.clone());

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let stash = stash.clone();
                let baz = baz.clone();
                tokio::spawn(async move { stash.fetch(&baz, "v1.0.0").await })
            })
            .collect();
        while stash.metrics().snapshot().joined_fetches < 7 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);

        for caller in callers {
            caller.await.unwrap().unwrap();
        }
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(stash.in_flight(), 0);
        assert_eq!(
            backend.manifest(&baz, "v1.0.0").await.unwrap(),
            b"module example.org/baz\n"
        );
        let snap = stash.metrics().snapshot();
        assert_eq!(snap.upstream_fetches, 1);
        assert_eq!(snap.joined_fetches, 7);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let fetcher = Arc::new(TestFetcher {
            failures_left: AtomicUsize::new(1),
            ..Default::default()
        });
        let (stash, backend) = stash_with(fetcher.clone());
        let m = module("example.org/flaky");

        let err = stash.fetch(&m, "v0.1.0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(!backend.exists(&m, "v0.1.0").await.unwrap());
        assert_eq!(stash.in_flight(), 0);

        stash.fetch(&m, "v0.1.0").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(backend.exists(&m, "v0.1.0").await.unwrap());
        assert_eq!(stash.metrics().snapshot().failed_fetches, 1);
    }

    #[tokio::test]
    async fn test_stored_key_skips_upstream() {
        let fetcher = Arc::new(TestFetcher::default());
        let (stash, _backend) = stash_with(fetcher.clone());
        let m = module("example.org/foo");

        stash.fetch(&m, "v0.0.1").await.unwrap();
        stash.fetch(&m, "v0.0.1").await.unwrap();
        stash.fetch(&m, "v0.0.1").await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_leader_does_not_strand_waiters() {
        let gate = Arc::new(Semaphore::new(0));
        let m = module("example.org/slow");
        let fetcher = Arc::new(TestFetcher {
            gate: Some((m.clone(), gate.clone())),
            ..Default::default()
        });
        let (stash, backend) = stash_with(fetcher.clone());

        let leader =
            tokio::time::timeout(Duration::from_millis(20), stash.fetch(&m, "v1.0.0")).await;
        assert!(leader.is_err(), "leader should time out while gated");
        assert_eq!(stash.in_flight(), 1);

        let waiter = {
            let stash = stash.clone();
            let m = m.clone();
            tokio::spawn(async move { stash.fetch(&m, "v1.0.0").await })
        };
        gate.add_permits(1);
        waiter.await.unwrap().unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert!(backend.exists(&m, "v1.0.0").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_different_keys_do_not_wait_on_each_other() {
        let gate = Arc::new(Semaphore::new(0));
        let slow = module("example.org/slow");
        let fetcher = Arc::new(TestFetcher {
            gate: Some((slow.clone(), gate.clone())),
            ..Default::default()
        });
        let (stash, _backend) = stash_with(fetcher.clone());

        let blocked = {
            let stash = stash.clone();
            let slow = slow.clone();
            tokio::spawn(async move { stash.fetch(&slow, "v1.0.0").await })
        };
        while fetcher.calls() == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(
            Duration::from_secs(5),
            stash.fetch(&module("example.org/fast"), "v1.0.0"),
        )
        .await
        .expect("unrelated key blocked")
        .unwrap();
        assert!(!blocked.is_finished());

        gate.add_permits(1);
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_manifest_is_synthesized() {
        let fetcher = Arc::new(TestFetcher {
            without_manifest: true,
            ..Default::default()
        });
        let (stash, backend) = stash_with(fetcher);
        let m = module("example.org/nomod/v2");

        stash.fetch(&m, "v2.0.0").await.unwrap();
        assert_eq!(
            backend.manifest(&m, "v2.0.0").await.unwrap(),
            b"module example.org/nomod/v2\n"
        );
        let archive = read_archive(backend.archive(&m, "v2.0.0").await.unwrap())
            .await
            .unwrap();
        assert_eq!(archive, b"example.org/nomod/v2@v2.0.0");
        assert_eq!(stash.metrics().snapshot().synthesized_manifests, 1);
    }

    #[tokio::test]
    async fn test_missing_manifest_without_synthesis_is_not_found() {
        let fetcher = Arc::new(TestFetcher {
            without_manifest: true,
            ..Default::default()
        });
        let backend = Arc::new(MemoryBackend::new());
        let stash = Stash::with_options(
            fetcher,
            backend.clone(),
            StashOptions {
                synthesize_missing_manifest: false,
            },
            CacheMetrics::default(),
        );
        let m = module("example.org/nomod");

        let err = stash.fetch(&m, "v1.0.0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_fetch_clears_entry() {
        let fetcher = Arc::new(TestFetcher {
            panic: true,
            ..Default::default()
        });
        let (stash, _backend) = stash_with(fetcher);

        let err = stash
            .fetch(&module("example.org/boom"), "v1.0.0")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(stash.in_flight(), 0);
    }

    /// Reads from memory; every save fails like a full disk.
    #[derive(Default)]
    struct FullDisk {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl Backend for FullDisk {
        fn name(&self) -> &'static str {
            "full-disk"
        }

        async fn list(&self, module: &ModulePath) -> Result<Vec<String>> {
            self.inner.list(module).await
        }

        async fn info(&self, module: &ModulePath, version: &str) -> Result<Vec<u8>> {
            self.inner.info(module, version).await
        }

        async fn manifest(&self, module: &ModulePath, version: &str) -> Result<Vec<u8>> {
            self.inner.manifest(module, version).await
        }

        async fn archive(&self, module: &ModulePath, version: &str) -> Result<ArchiveReader> {
            self.inner.archive(module, version).await
        }

        async fn save(
            &self,
            _module: &ModulePath,
            _version: &str,
            _manifest: &[u8],
            _archive: ArchiveReader,
            _info: &[u8],
        ) -> Result<()> {
            Err(ProxyError::backend("disk full"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_save_failure_reaches_every_waiter() {
        let gate = Arc::new(Semaphore::new(0));
        let m = module("example.org/big");
        let fetcher = Arc::new(TestFetcher {
            gate: Some((m.clone(), gate.clone())),
            ..Default::default()
        });
        let backend = Arc::new(FullDisk::default());
        let stash = Stash::new(fetcher.clone(), backend.clone());

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let stash = stash.clone();
                let m = m.clone();
                tokio::spawn(async move { stash.fetch(&m, "v1.0.0").await })
            })
            .collect();
        while stash.metrics().snapshot().joined_fetches < 7 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);

        for caller in callers {
            let err = caller.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        }
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(stash.in_flight(), 0);
        assert!(!backend.exists(&m, "v1.0.0").await.unwrap());

        // Nothing was stored, so the next caller fetches again.
        gate.add_permits(1);
        let err = stash.fetch(&m, "v1.0.0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(stash.in_flight(), 0);
    }
}
