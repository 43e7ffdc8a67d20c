use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::{debug, info};

use modproxy_stash::{Fetcher, Stash, StashOptions};
use modproxy_storage::{ArchiveReader, Backend, CacheMetrics};
use modproxy_types::version::sort_ascending;
use modproxy_types::{ModulePath, ProxyError, Result, RevInfo, Version};

use crate::lister::Lister;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolOptions {
    /// Upper bound for each operation. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub stash: StashOptions,
}

/// The five protocol operations over one backend and one upstream.
///
/// Inputs are validated before any storage or upstream access. Every
/// operation can be cancelled by dropping its future.
pub struct Protocol {
    backend: Arc<dyn Backend>,
    lister: Arc<dyn Lister>,
    stash: Stash,
    timeout: Option<Duration>,
}

impl Protocol {
    pub fn new(
        backend: Arc<dyn Backend>,
        fetcher: Arc<dyn Fetcher>,
        lister: Arc<dyn Lister>,
    ) -> Self {
        Self::with_options(
            backend,
            fetcher,
            lister,
            ProtocolOptions::default(),
            CacheMetrics::default(),
        )
    }

    pub fn with_options(
        backend: Arc<dyn Backend>,
        fetcher: Arc<dyn Fetcher>,
        lister: Arc<dyn Lister>,
        options: ProtocolOptions,
        metrics: CacheMetrics,
    ) -> Self {
        let stash = Stash::with_options(fetcher, Arc::clone(&backend), options.stash, metrics);
        Self {
            backend,
            lister,
            stash,
            timeout: options.timeout,
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        self.stash.metrics()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Tagged versions, ascending by precedence. Pseudo-versions are never
    /// listed. An untagged module yields an empty list.
    pub async fn list(&self, module: &str) -> Result<Vec<String>> {
        let module = ModulePath::parse(module)?;
        self.bounded("list", self.list_versions(&module)).await
    }

    /// The highest tagged version, or a pseudo-version for the default-branch
    /// head when there are no tags.
    pub async fn latest(&self, module: &str) -> Result<RevInfo> {
        let module = ModulePath::parse(module)?;
        self.bounded("latest", self.resolve_latest(&module)).await
    }

    /// Serialized [`RevInfo`] for one version.
    pub async fn info(&self, module: &str, version: &str) -> Result<Vec<u8>> {
        let module = ModulePath::parse(module)?;
        Version::parse(version)?;
        self.bounded(
            "info",
            self.cached(&module, version, || self.backend.info(&module, version)),
        )
        .await
    }

    pub async fn manifest(&self, module: &str, version: &str) -> Result<Vec<u8>> {
        let module = ModulePath::parse(module)?;
        Version::parse(version)?;
        self.bounded(
            "manifest",
            self.cached(&module, version, || self.backend.manifest(&module, version)),
        )
        .await
    }

    /// Archive stream for one version. The timeout covers opening the
    /// stream, not reading it.
    pub async fn archive(&self, module: &str, version: &str) -> Result<ArchiveReader> {
        let module = ModulePath::parse(module)?;
        Version::parse(version)?;
        self.bounded(
            "archive",
            self.cached(&module, version, || self.backend.archive(&module, version)),
        )
        .await
    }

    async fn list_versions(&self, module: &ModulePath) -> Result<Vec<String>> {
        let (stored, upstream) =
            tokio::join!(self.backend.list(module), self.lister.list(module));
        let stored = stored?;
        let upstream = match upstream {
            Ok(tags) => tags,
            Err(e) if e.is_not_found() && !stored.is_empty() => {
                debug!(%module, stored = stored.len(), "module unknown upstream, using storage");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(merge_versions(stored.into_iter().chain(upstream)))
    }

    async fn resolve_latest(&self, module: &ModulePath) -> Result<RevInfo> {
        let tags: Vec<Version> = self
            .list_versions(module)
            .await?
            .iter()
            .filter_map(|v| Version::parse(v).ok())
            .collect();

        let Some(highest) = tags.last() else {
            let head = self.lister.head(module).await?;
            let pseudo = Version::pseudo(module.major(), head.time, &head.id)?;
            info!(%module, version = pseudo.as_str(), "no tags, using default-branch head");
            return Ok(RevInfo::new(pseudo.as_str(), head.time));
        };

        let tied: Vec<&Version> = tags.iter().filter(|v| *v == highest).collect();
        if let [only] = tied.as_slice() {
            return self.rev_info(module, only.as_str()).await;
        }

        // Equal precedence (differing build metadata): the most recently
        // committed revision wins; equal times keep the later spelling.
        let candidates =
            try_join_all(tied.iter().map(|v| self.rev_info(module, v.as_str()))).await?;
        let mut best: Option<RevInfo> = None;
        for candidate in candidates {
            if best.as_ref().is_none_or(|b| candidate.time >= b.time) {
                best = Some(candidate);
            }
        }
        best.ok_or_else(|| ProxyError::not_found(module))
    }

    /// Stored info when present, else the lister's. Never starts an
    /// artifact fetch.
    async fn rev_info(&self, module: &ModulePath, version: &str) -> Result<RevInfo> {
        match self.backend.info(module, version).await {
            Ok(bytes) => RevInfo::from_json(&bytes),
            Err(e) if e.is_not_found() => {
                debug!(%module, version, "info not stored, asking lister");
                self.lister.info(module, version).await
            }
            Err(e) => Err(e),
        }
    }

    /// Read from storage; on a miss fetch through the stash and read again.
    async fn cached<T, F, Fut>(&self, module: &ModulePath, version: &str, read: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match read().await {
            Ok(found) => {
                self.stash.metrics().record_storage_hit();
                return Ok(found);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.stash.metrics().record_storage_miss();
        debug!(%module, version, "storage miss");
        self.stash.fetch(module, version).await?;
        read().await
    }

    async fn bounded<T>(&self, operation: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        match self.timeout {
            Some(after) => tokio::time::timeout(after, op)
                .await
                .map_err(|_| ProxyError::timeout(operation, after))?,
            None => op.await,
        }
    }
}

/// Merge version strings into a sorted, de-duplicated listing. Unparseable
/// strings and pseudo-versions are dropped.
pub fn merge_versions<I, S>(versions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed: Vec<Version> = versions
        .into_iter()
        .filter_map(|v| Version::parse(v.as_ref()).ok())
        .filter(|v| !v.is_pseudo())
        .collect();
    sort_ascending(&mut parsed);
    parsed.dedup_by(|a, b| a.as_str() == b.as_str());
    parsed.into_iter().map(|v| v.as_str().to_string()).collect()
}
