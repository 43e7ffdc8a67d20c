//! Client for an upstream module proxy.
//!
//! Endpoints, relative to the base URL:
//!
//! ```text
//! <module>/@v/list          newline-separated tags
//! <module>/@v/<version>.info
//! <module>/@v/<version>.mod
//! <module>/@v/<version>.zip
//! <module>/@latest          default-branch head
//! ```
//!
//! Module paths and versions are case-escaped in URLs. `ureq` is blocking,
//! so every request runs on the blocking pool.

use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use modproxy_protocol::Lister;
use modproxy_stash::{FetchedVersion, Fetcher};
use modproxy_storage::archive_from_bytes;
use modproxy_types::env_utils::env_var_or;
use modproxy_types::module::escape_case;
use modproxy_types::{ModulePath, ProxyError, Result, RevInfo, Revision, Version};

/// Body of the `@latest` endpoint.
#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Time")]
    time: DateTime<Utc>,
    #[serde(rename = "Origin", default)]
    origin: Option<Origin>,
}

#[derive(Debug, Deserialize)]
struct Origin {
    #[serde(rename = "Hash", default)]
    hash: Option<String>,
}

#[derive(Clone)]
pub struct HttpUpstream {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpUpstream {
    /// Default request timeout in seconds (can be overridden by env).
    const DEFAULT_TIMEOUT_SECS: u64 = 60;
    /// Default connect timeout in seconds (can be overridden by env).
    const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

    fn default_timeouts() -> (Duration, Duration) {
        (
            Duration::from_secs(env_var_or(
                "MODPROXY_UPSTREAM_TIMEOUT_SECS",
                Self::DEFAULT_TIMEOUT_SECS,
            )),
            Duration::from_secs(env_var_or(
                "MODPROXY_UPSTREAM_CONNECT_TIMEOUT_SECS",
                Self::DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
        )
    }

    fn build_agent(timeout: Duration, connect_timeout: Duration) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout(timeout)
            .timeout_connect(connect_timeout)
            .build()
    }

    pub fn new(base_url: &str) -> Self {
        let (timeout, connect_timeout) = Self::default_timeouts();
        Self::with_timeouts(base_url, timeout, connect_timeout)
    }

    pub fn with_timeouts(base_url: &str, timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: Self::build_agent(timeout, connect_timeout),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn module_url(&self, module: &ModulePath, endpoint: &str) -> String {
        format!("{}/{}/{endpoint}", self.base_url, module.escaped())
    }

    fn version_url(&self, module: &ModulePath, version: &str, ext: &str) -> String {
        self.module_url(module, &format!("@v/{}.{ext}", escape_case(version)))
    }

    /// GET `url`. `Ok(None)` means upstream answered 404 or 410.
    async fn get(&self, url: String) -> Result<Option<Vec<u8>>> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || get_blocking(&agent, &url))
            .await
            .map_err(|e| ProxyError::upstream(&self.base_url, format!("request task failed: {e}")))?
    }

    async fn get_required(&self, url: String, what: impl std::fmt::Display) -> Result<Vec<u8>> {
        self.get(url).await?.ok_or_else(|| ProxyError::not_found(what))
    }

    /// Turn a missing module into `InvalidModule` when an ancestor is a
    /// module root, so sub-directories fail distinctly.
    async fn missing_module(&self, module: &ModulePath) -> ProxyError {
        for ancestor in module.ancestors() {
            match self.get(self.module_url(&ancestor, "@v/list")).await {
                Ok(Some(_)) => {
                    return ProxyError::invalid_module(
                        module,
                        format!("sub-directory of module {ancestor}"),
                    )
                }
                Ok(None) => continue,
                Err(e) => return e,
            }
        }
        ProxyError::not_found(module)
    }

    /// A missing version is `NotFound`, unless the module itself is a
    /// sub-directory of another module.
    async fn missing_version(&self, module: &ModulePath, key: &str) -> ProxyError {
        match self.missing_module(module).await {
            ProxyError::NotFound { .. } => ProxyError::not_found(key),
            e => e,
        }
    }
}

fn get_blocking(agent: &ureq::Agent, url: &str) -> Result<Option<Vec<u8>>> {
    debug!(url, "upstream request");
    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(404 | 410, _)) => return Ok(None),
        Err(ureq::Error::Status(code, _)) => {
            return Err(ProxyError::upstream(url, format!("HTTP {code}")))
        }
        Err(e) => return Err(ProxyError::upstream(url, e)),
    };
    let mut body = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| ProxyError::upstream(url, format!("failed to read response body: {e}")))?;
    Ok(Some(body))
}

/// Tags from a `@v/list` body: one per line, blanks ignored.
pub fn parse_list(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Head revision from a `@latest` body. The full hash from `Origin` is
/// preferred; otherwise the abbreviated id inside the pseudo-version is used.
pub fn parse_latest(module: &ModulePath, body: &[u8]) -> Result<Revision> {
    let latest: LatestResponse = serde_json::from_slice(body)
        .map_err(|e| ProxyError::upstream(module, format!("malformed @latest response: {e}")))?;
    let id = match latest.origin.and_then(|o| o.hash) {
        Some(hash) => hash,
        None => Version::parse(&latest.version)?
            .pseudo_revision()
            .map(str::to_string)
            .ok_or_else(|| {
                ProxyError::upstream(
                    module,
                    format!("@latest returned {} without a revision id", latest.version),
                )
            })?,
    };
    Ok(Revision {
        id,
        time: latest.time,
    })
}

#[async_trait]
impl Lister for HttpUpstream {
    async fn list(&self, module: &ModulePath) -> Result<Vec<String>> {
        match self.get(self.module_url(module, "@v/list")).await? {
            Some(body) => Ok(parse_list(&body)),
            None => Err(self.missing_module(module).await),
        }
    }

    async fn head(&self, module: &ModulePath) -> Result<Revision> {
        match self.get(self.module_url(module, "@latest")).await? {
            Some(body) => parse_latest(module, &body),
            None => Err(self.missing_module(module).await),
        }
    }

    async fn info(&self, module: &ModulePath, version: &str) -> Result<RevInfo> {
        match self.get(self.version_url(module, version, "info")).await? {
            Some(body) => RevInfo::from_json(&body),
            None => Err(self.missing_version(module, &format!("{module}@{version}")).await),
        }
    }
}

#[async_trait]
impl Fetcher for HttpUpstream {
    async fn fetch(&self, module: &ModulePath, version: &str) -> Result<FetchedVersion> {
        let key = format!("{module}@{version}");
        let info = match self.get(self.version_url(module, version, "info")).await? {
            Some(info) => info,
            None => return Err(self.missing_version(module, &key).await),
        };
        let manifest = self.get(self.version_url(module, version, "mod")).await?;
        let archive = self
            .get_required(
                self.version_url(module, version, "zip"),
                format!("archive for {key}"),
            )
            .await?;
        Ok(FetchedVersion {
            info,
            manifest,
            archive: archive_from_bytes(archive),
        })
    }
}
