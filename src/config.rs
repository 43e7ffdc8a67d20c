//! Proxy configuration.
//!
//! Settings are layered: TOML file, then `MODPROXY_*` environment
//! variables, then command-line flags (applied by the binary). After
//! layering, timeouts left unset inherit the global one, and the result is
//! turned into exactly one backend and one upstream.
//!
//! ```toml
//! timeout_secs = 300
//! operation_timeout_secs = 60
//! synthesize_missing_manifest = true
//! filter_file = "/etc/modproxy/filter"
//!
//! [storage]
//! type = "disk"
//! root = "/var/cache/modproxy"
//!
//! [upstream]
//! url = "https://proxy.golang.org"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use modproxy_protocol::{Lister, Protocol, ProtocolOptions};
use modproxy_stash::{Fetcher, StashOptions};
use modproxy_storage::{Backend, CacheMetrics, FsBackend, MemoryBackend};
use modproxy_types::env_utils::{env_string, parse_bool};
use modproxy_upstream::{DirUpstream, HttpUpstream};

use crate::filter::ModuleFilter;

pub const DEFAULT_UPSTREAM_URL: &str = "https://proxy.golang.org";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Connect timeout for the HTTP upstream; not configurable per file.
const UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 10;

/// `MODPROXY_HOME`, else `~/.modproxy`.
pub fn modproxy_home() -> PathBuf {
    env_string("MODPROXY_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".modproxy")
        })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Disk,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Ok(StorageKind::Memory),
            "disk" | "fs" => Ok(StorageKind::Disk),
            other => bail!("unknown storage type {other:?} (expected memory or disk)"),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::Memory => "memory",
            StorageKind::Disk => "disk",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// Root directory for `disk` storage. Defaults to `<home>/cache`.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL of an upstream module proxy.
    pub url: Option<String>,
    /// Local mirror directory. Mutually exclusive with `url`.
    pub dir: Option<PathBuf>,
    /// HTTP request timeout. Inherits `timeout_secs` when unset.
    pub timeout_secs: Option<u64>,
}

/// Where upstream requests go once configuration is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSource {
    Url(String),
    Dir(PathBuf),
}

impl UpstreamSource {
    /// `http://` / `https://` values are URLs; anything else is a directory.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.starts_with("http://") || value.starts_with("https://") {
            UpstreamSource::Url(value.to_string())
        } else {
            UpstreamSource::Dir(PathBuf::from(value))
        }
    }
}

impl fmt::Display for UpstreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamSource::Url(url) => f.write_str(url),
            UpstreamSource::Dir(dir) => write!(f, "{}", dir.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Global timeout in seconds; unset timeouts inherit it.
    pub timeout_secs: u64,
    /// Bound on one whole operation (list, latest, info, mod, zip),
    /// storage reads and the upstream fetch included.
    pub operation_timeout_secs: Option<u64>,
    pub synthesize_missing_manifest: bool,
    /// Include/Exclude/Direct rules; everything is included when unset.
    pub filter_file: Option<PathBuf>,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            operation_timeout_secs: None,
            synthesize_missing_manifest: true,
            filter_file: None,
            storage: StorageConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml_str(&text)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `MODPROXY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(env_string)
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(kind) = lookup("MODPROXY_STORAGE_TYPE") {
            self.storage.kind = kind.parse()?;
        }
        if let Some(root) = lookup("MODPROXY_STORAGE_ROOT") {
            self.storage.root = Some(PathBuf::from(root));
        }
        if let Some(upstream) = lookup("MODPROXY_UPSTREAM") {
            self.set_upstream(UpstreamSource::parse(&upstream));
        }
        if let Some(secs) = lookup("MODPROXY_TIMEOUT_SECS") {
            self.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("MODPROXY_TIMEOUT_SECS={secs:?} is not a number"))?;
        }
        if let Some(flag) = lookup("MODPROXY_SYNTHESIZE_MANIFEST") {
            self.synthesize_missing_manifest = parse_bool(&flag);
        }
        if let Some(file) = lookup("MODPROXY_FILTER_FILE") {
            self.filter_file = Some(PathBuf::from(file));
        }
        Ok(())
    }

    /// Replace whichever upstream is configured.
    pub fn set_upstream(&mut self, source: UpstreamSource) {
        match source {
            UpstreamSource::Url(url) => {
                self.upstream.url = Some(url);
                self.upstream.dir = None;
            }
            UpstreamSource::Dir(dir) => {
                self.upstream.dir = Some(dir);
                self.upstream.url = None;
            }
        }
    }

    /// Give every timeout left unset the global one.
    pub fn propagate_timeouts(&mut self) {
        self.operation_timeout_secs.get_or_insert(self.timeout_secs);
        self.upstream.timeout_secs.get_or_insert(self.timeout_secs);
    }

    pub fn upstream_source(&self) -> Result<UpstreamSource> {
        match (&self.upstream.url, &self.upstream.dir) {
            (Some(_), Some(_)) => bail!("upstream.url and upstream.dir are mutually exclusive"),
            (Some(url), None) => Ok(UpstreamSource::Url(url.clone())),
            (None, Some(dir)) => Ok(UpstreamSource::Dir(dir.clone())),
            (None, None) => Ok(UpstreamSource::Url(DEFAULT_UPSTREAM_URL.to_string())),
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| modproxy_home().join("cache"))
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.unwrap_or(self.timeout_secs))
    }

    fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs.unwrap_or(self.timeout_secs))
    }

    pub fn build_backend(&self) -> Result<Arc<dyn Backend>> {
        match self.storage.kind {
            StorageKind::Memory => Ok(Arc::new(MemoryBackend::new())),
            StorageKind::Disk => {
                let root = self.storage_root();
                let backend = FsBackend::new(&root).with_context(|| {
                    format!("failed to open disk storage at {}", root.display())
                })?;
                Ok(Arc::new(backend))
            }
        }
    }

    pub fn build_upstream(&self) -> Result<(Arc<dyn Fetcher>, Arc<dyn Lister>)> {
        match self.upstream_source()? {
            UpstreamSource::Url(url) => {
                let upstream = Arc::new(HttpUpstream::with_timeouts(
                    &url,
                    self.upstream_timeout(),
                    Duration::from_secs(UPSTREAM_CONNECT_TIMEOUT_SECS),
                ));
                let fetcher: Arc<dyn Fetcher> = upstream.clone();
                Ok((fetcher, upstream))
            }
            UpstreamSource::Dir(dir) => {
                if !dir.is_dir() {
                    bail!("upstream mirror {} is not a directory", dir.display());
                }
                let upstream = Arc::new(DirUpstream::new(dir));
                let fetcher: Arc<dyn Fetcher> = upstream.clone();
                Ok((fetcher, upstream))
            }
        }
    }

    pub fn protocol_options(&self) -> ProtocolOptions {
        ProtocolOptions {
            timeout: Some(self.operation_timeout()),
            stash: StashOptions {
                synthesize_missing_manifest: self.synthesize_missing_manifest,
            },
        }
    }

    /// Wire the configured backend and upstream into a [`Protocol`].
    pub fn build_protocol(&self, metrics: CacheMetrics) -> Result<Protocol> {
        let backend = self.build_backend()?;
        self.build_protocol_with_backend(backend, metrics)
    }

    /// Like [`build_protocol`](Self::build_protocol) over a caller-chosen backend.
    pub fn build_protocol_with_backend(
        &self,
        backend: Arc<dyn Backend>,
        metrics: CacheMetrics,
    ) -> Result<Protocol> {
        let (fetcher, lister) = self.build_upstream()?;
        debug!(
            storage = %self.storage.kind,
            upstream = %self.upstream_source()?,
            "building protocol"
        );
        Ok(Protocol::with_options(
            backend,
            fetcher,
            lister,
            self.protocol_options(),
            metrics,
        ))
    }

    pub fn build_filter(&self) -> Result<ModuleFilter> {
        match &self.filter_file {
            Some(path) => ModuleFilter::load(path),
            None => Ok(ModuleFilter::default()),
        }
    }
}
