//! modproxy: resolve and cache modules from the command line.
//!
//! Every command goes through the same protocol a proxy server would use:
//! stored artifact sets are served from storage, misses are fetched from
//! upstream once and saved before being returned.
//!
//! ## Example Usage
//!
//! ```bash
//! # Tagged versions, ascending
//! modproxy list github.com/pkg/errors
//!
//! # Highest tag, or a pseudo-version for the default branch
//! modproxy latest github.com/pkg/errors
//!
//! # Artifacts for one version, cached on disk
//! modproxy --storage disk info github.com/pkg/errors v0.9.1
//! modproxy --storage disk zip github.com/pkg/errors v0.9.1 --out errors.zip
//!
//! # Serve from a local mirror instead of an HTTP proxy
//! modproxy --upstream ./mirror list example.org/foo
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use modproxy::config::{ProxyConfig, StorageKind, UpstreamSource};
use modproxy::filter::{redirect_url, FilterRule, ModuleFilter};
use modproxy::{CacheMetrics, Protocol, ProxyError};
use modproxy_storage::{Backend, MemoryBackend};

#[derive(Parser)]
#[command(
    name = "modproxy",
    author,
    version,
    about = "Caching module proxy",
    long_about = "Resolve module versions and fetch their artifacts through a local cache.\n\n\
                  Concurrent requests for the same version share one upstream fetch."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage engine (overrides config)
    #[arg(long, global = true, value_enum)]
    storage: Option<StorageKind>,

    /// Root directory for disk storage
    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    /// Upstream proxy URL or local mirror directory
    #[arg(long, global = true)]
    upstream: Option<String>,

    /// Global timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Print cache counters to stderr after the command
    #[arg(long, global = true)]
    stats: bool,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Args)]
struct ModuleArgs {
    /// Module path, e.g. github.com/pkg/errors
    module: String,
}

#[derive(Args)]
struct VersionArgs {
    /// Module path, e.g. github.com/pkg/errors
    module: String,
    /// Version, e.g. v0.9.1
    version: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List tagged versions
    List(ModuleArgs),

    /// Resolve the latest version
    Latest(ModuleArgs),

    /// Print the revision info of a version
    Info(VersionArgs),

    /// Print the module manifest of a version
    Mod(VersionArgs),

    /// Write the source archive of a version
    Zip {
        #[command(flatten)]
        target: VersionArgs,
        /// Destination file
        #[arg(long, short)]
        out: PathBuf,
    },

    /// Show which filter rule applies to a module
    Filter {
        module: String,
        /// Rule file (overrides config)
        #[arg(long)]
        filter_file: Option<PathBuf>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::List(_) => "list",
            Commands::Latest(_) => "latest",
            Commands::Info(_) => "info",
            Commands::Mod(_) => "mod",
            Commands::Zip { .. } => "zip",
            Commands::Filter { .. } => "filter",
        }
    }

    /// The module a command resolves through the protocol, if any.
    fn module(&self) -> Option<&str> {
        match self {
            Commands::List(args) | Commands::Latest(args) => Some(args.module.as_str()),
            Commands::Info(args) | Commands::Mod(args) => Some(args.module.as_str()),
            Commands::Zip { target, .. } => Some(target.module.as_str()),
            Commands::Filter { .. } => None,
        }
    }

    fn request_path(&self) -> Option<String> {
        Some(match self {
            Commands::List(a) => format!("{}/@v/list", a.module),
            Commands::Latest(a) => format!("{}/@latest", a.module),
            Commands::Info(a) => format!("{}/@v/{}.info", a.module, a.version),
            Commands::Mod(a) => format!("{}/@v/{}.mod", a.module, a.version),
            Commands::Zip { target, .. } => {
                format!("{}/@v/{}.zip", target.module, target.version)
            }
            Commands::Filter { .. } => return None,
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn resolve_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = ProxyConfig::load(cli.config.as_deref())?;
    if let Some(kind) = cli.storage {
        config.storage.kind = kind;
    }
    if let Some(root) = &cli.storage_root {
        config.storage.root = Some(root.clone());
    }
    if let Some(upstream) = &cli.upstream {
        config.set_upstream(UpstreamSource::parse(upstream));
    }
    if let Some(secs) = cli.timeout_secs {
        config.timeout_secs = secs;
    }
    config.propagate_timeouts();
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let command_name = cli.command.name();
    let json = cli.json;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(command_name, &err, json);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;

    if let Commands::Filter {
        module,
        filter_file,
    } = &cli.command
    {
        let filter = match filter_file {
            Some(path) => ModuleFilter::load(path)?,
            None => config.build_filter()?,
        };
        return print_rule(&config, &filter, module, cli.json);
    }

    let filter = config.build_filter()?;
    let metrics = CacheMetrics::default();
    let rule = cli.command.module().map(|m| (m, filter.rule(m)));
    let proxy = match rule {
        Some((module, FilterRule::Exclude)) => {
            bail!("module {module} is excluded by filter rules");
        }
        Some((_, FilterRule::Direct)) => {
            if let Some(path) = cli.command.request_path() {
                info!(
                    redirect = %redirect_url(&config.upstream_source()?.to_string(), &path),
                    "direct module, bypassing cache"
                );
            }
            let scratch: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
            config.build_protocol_with_backend(scratch, metrics.clone())?
        }
        _ => config.build_protocol(metrics.clone())?,
    };
    debug!(command = cli.command.name(), storage = %config.storage.kind, "running");

    let result = execute(&proxy, cli.command, cli.json).await;

    if cli.stats {
        let snapshot = metrics.snapshot();
        let mut report = serde_json::to_value(snapshot)?;
        report["hit_rate"] = serde_json::json!(snapshot.hit_rate());
        eprintln!("{}", serde_json::to_string_pretty(&report)?);
    }
    result
}

async fn execute(proxy: &Protocol, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::List(ModuleArgs { module }) => {
            let versions = proxy.list(&module).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&versions)?);
            } else {
                for version in versions {
                    println!("{version}");
                }
            }
        }
        Commands::Latest(ModuleArgs { module }) => {
            let latest = proxy.latest(&module).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&latest)?);
            } else {
                println!("{} {}", latest.version, latest.time.to_rfc3339());
            }
        }
        Commands::Info(VersionArgs { module, version }) => {
            let info = proxy.info(&module, &version).await?;
            write_stdout(&info).await?;
        }
        Commands::Mod(VersionArgs { module, version }) => {
            let manifest = proxy.manifest(&module, &version).await?;
            if json {
                let text = String::from_utf8_lossy(&manifest);
                println!(
                    "{}",
                    serde_json::json!({ "module": module, "version": version, "mod": text })
                );
            } else {
                write_stdout(&manifest).await?;
            }
        }
        Commands::Zip {
            target: VersionArgs { module, version },
            out,
        } => {
            let mut archive = proxy.archive(&module, &version).await?;
            let mut file = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("failed to create {}", out.display()))?;
            let written = tokio::io::copy(&mut archive, &mut file)
                .await
                .with_context(|| format!("failed to write {}", out.display()))?;
            file.flush().await?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "path": out.display().to_string(), "bytes": written })
                );
            } else {
                println!("Wrote {written} bytes to {}", out.display());
            }
        }
        Commands::Filter { module, .. } => bail!("filter does not resolve {module}"),
    }
    Ok(())
}

fn print_rule(config: &ProxyConfig, filter: &ModuleFilter, module: &str, json: bool) -> Result<()> {
    let rule = filter.rule(module);
    let redirect = match rule {
        FilterRule::Direct => Some(redirect_url(
            &config.upstream_source()?.to_string(),
            &format!("{module}/@v/list"),
        )),
        _ => None,
    };
    if json {
        println!(
            "{}",
            serde_json::json!({ "module": module, "rule": rule, "redirect": redirect })
        );
    } else {
        match redirect {
            Some(url) => println!("{rule} {url}"),
            None => println!("{rule}"),
        }
    }
    Ok(())
}

async fn write_stdout(bytes: &[u8]) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(bytes).await?;
    if !bytes.ends_with(b"\n") {
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;
    Ok(())
}

fn report_error(command: &str, err: &anyhow::Error, json: bool) {
    let kind = err.downcast_ref::<ProxyError>().map(ProxyError::kind);
    if json {
        eprintln!(
            "{}",
            serde_json::json!({
                "command": command,
                "error": format!("{err:#}"),
                "kind": kind.map(|k| format!("{k:?}")),
                "status": kind.map(|k| k.http_status()),
            })
        );
    } else {
        eprintln!("Error: {err:#}");
    }
}
