//! Call-counting upstream fixture shared by the protocol tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use modproxy_protocol::{Lister, Protocol, ProtocolOptions};
use modproxy_stash::{FetchedVersion, Fetcher};
use modproxy_storage::{archive_from_bytes, Backend, CacheMetrics};
use modproxy_types::{ModulePath, ProxyError, Result, RevInfo, Revision, Version};

pub fn time(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("fixture timestamp")
        .with_timezone(&Utc)
}

#[derive(Default, Clone)]
struct FixtureModule {
    tags: Vec<(String, DateTime<Utc>)>,
    head: Option<Revision>,
    without_manifest: bool,
}

/// An in-memory upstream: modules with tags and a head revision.
///
/// Paths below a registered module are treated as sub-directories and fail
/// with `InvalidModule`; anything else unknown is `NotFound`.
#[derive(Default)]
pub struct FixtureUpstream {
    modules: HashMap<ModulePath, FixtureModule>,
    fetch_delay: Option<Duration>,
    failures_left: AtomicUsize,
    pub fetches: AtomicUsize,
    pub lists: AtomicUsize,
    pub heads: AtomicUsize,
    pub infos: AtomicUsize,
}

impl FixtureUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scenario modules: `example.org/foo` with three tags, untagged
    /// `example.org/bar`, and `example.org/baz` tagged `v1.0.0`.
    pub fn scenarios() -> Self {
        Self::new()
            .with_tags(
                "example.org/foo",
                &[
                    ("v0.0.1", "2018-08-03T03:45:19Z"),
                    ("v0.0.2", "2018-08-03T03:45:19Z"),
                    ("v0.0.3", "2018-08-03T03:45:19Z"),
                ],
            )
            .with_head("example.org/bar", "abc1234", "2018-08-03T17:14:26Z")
            .with_tags("example.org/baz", &[("v1.0.0", "2019-01-02T03:04:05Z")])
    }

    pub fn with_tags(mut self, module: &str, tags: &[(&str, &str)]) -> Self {
        let entry = self.entry(module);
        entry
            .tags
            .extend(tags.iter().map(|(v, t)| (v.to_string(), time(t))));
        self
    }

    pub fn with_head(mut self, module: &str, id: &str, at: &str) -> Self {
        self.entry(module).head = Some(Revision {
            id: id.to_string(),
            time: time(at),
        });
        self
    }

    pub fn without_manifest(mut self, module: &str) -> Self {
        self.entry(module).without_manifest = true;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Fail the next `n` fetches with an upstream error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn info_count(&self) -> usize {
        self.infos.load(Ordering::SeqCst)
    }

    fn entry(&mut self, module: &str) -> &mut FixtureModule {
        let module = ModulePath::parse(module).expect("fixture module path");
        self.modules.entry(module).or_default()
    }

    /// Tag time, or the commit time carried by a pseudo-version.
    fn committed(&self, module: &ModulePath, version: &str) -> Result<DateTime<Utc>> {
        let found = self.lookup(module)?;
        match found.tags.iter().find(|(v, _)| v == version) {
            Some((_, t)) => Ok(*t),
            None => Version::parse(version)?
                .pseudo_time()
                .ok_or_else(|| ProxyError::not_found(format!("{module}@{version}"))),
        }
    }

    fn lookup(&self, module: &ModulePath) -> Result<&FixtureModule> {
        if let Some(found) = self.modules.get(module) {
            return Ok(found);
        }
        if let Some(root) = module.ancestors().find(|a| self.modules.contains_key(a)) {
            return Err(ProxyError::invalid_module(
                module,
                format!("sub-directory of module {root}"),
            ));
        }
        Err(ProxyError::not_found(module))
    }
}

#[async_trait]
impl Lister for FixtureUpstream {
    async fn list(&self, module: &ModulePath) -> Result<Vec<String>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let found = self.lookup(module)?;
        // Upstream order is not sorted.
        Ok(found.tags.iter().rev().map(|(v, _)| v.clone()).collect())
    }

    async fn head(&self, module: &ModulePath) -> Result<Revision> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.lookup(module)?
            .head
            .clone()
            .ok_or_else(|| ProxyError::not_found(format!("{module} default branch")))
    }

    async fn info(&self, module: &ModulePath, version: &str) -> Result<RevInfo> {
        self.infos.fetch_add(1, Ordering::SeqCst);
        Ok(RevInfo::new(version, self.committed(module, version)?))
    }
}

#[async_trait]
impl Fetcher for FixtureUpstream {
    async fn fetch(&self, module: &ModulePath, version: &str) -> Result<FetchedVersion> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProxyError::upstream(module, "connection reset by peer"));
        }

        let info = RevInfo::new(version, self.committed(module, version)?).to_json()?;
        let found = self.lookup(module)?;
        let manifest =
            (!found.without_manifest).then(|| format!("module {module}\n").into_bytes());
        Ok(FetchedVersion {
            info,
            manifest,
            archive: archive_from_bytes(format!("{module}@{version}").into_bytes()),
        })
    }
}

/// A protocol over `backend` with `upstream` as both fetcher and lister.
pub fn protocol(backend: Arc<dyn Backend>, upstream: Arc<FixtureUpstream>) -> Protocol {
    protocol_with(backend, upstream, ProtocolOptions::default())
}

pub fn protocol_with(
    backend: Arc<dyn Backend>,
    upstream: Arc<FixtureUpstream>,
    options: ProtocolOptions,
) -> Protocol {
    Protocol::with_options(
        backend,
        upstream.clone(),
        upstream,
        options,
        CacheMetrics::default(),
    )
}
