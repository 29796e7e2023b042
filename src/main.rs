//! `stapled` — watches certificate directories, acquires OCSP staples
//! for the certificates that need them, and keeps those staples
//! refreshed on disk next to the certificate they belong to.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stapled::config::{Config, LogFormat};
use stapled::pipeline::{Orchestrator, Watcher};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stapled", about = "OCSP staple daemon")]
struct Args {
    /// Path to the TOML config file. Defaults to `./stapled.toml`, then
    /// `/etc/stapled/stapled.toml` if neither that nor this flag is given.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Force looking for the config under /etc/stapled instead of the
    /// user config directory when `--config` is not given.
    #[arg(long)]
    system: bool,

    /// No-op: this process never daemonizes or forks, it only ever runs
    /// in the foreground. Kept so existing supervisors invoking with
    /// `--foreground` don't need to drop the flag.
    #[arg(long)]
    foreground: bool,

    /// Raise the log level (stackable: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    // Best-effort: a local `.env` is a development convenience, never a
    // deployment requirement, so a missing file is not an error.
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let config_path = match Config::resolve_path(args.config.clone(), args.system) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("stapled: {e:#}");
            std::process::exit(1);
        }
    };
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("stapled: {e:#}");
            std::process::exit(1);
        }
    };
    init_tracing(args.verbose, config.log_format);
    info!(path = %config_path.display(), "loaded configuration");

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    let code = match rt.block_on(run(config)) {
        Ok(()) => 0,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!("{e:#}");
            1
        }
        Err(e) => {
            error!("{e:#}");
            2
        }
    };
    std::process::exit(code);
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ConfigError(String);

fn init_tracing(verbosity: u8, format: LogFormat) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: Config) -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider was already installed"))?;

    let trust_store = load_trust_store(&config.trust_store_path)
        .with_context(|| format!("loading trust store from {}", config.trust_store_path.display()))
        .map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;

    let orchestrator = Orchestrator::new(config.clone(), trust_store)?;

    let existing = Watcher::initial_scan(&config.watch_paths, &config.extensions);
    info!(count = existing.len(), "found existing certificates");
    orchestrator.bootstrap(existing).await;

    let (watcher, mut events) = Watcher::spawn(&config.watch_paths, &config.extensions)?;

    let shutdown = stapled::shutdown::install()?;

    let event_orchestrator = orchestrator.clone();
    let mut event_shutdown = shutdown.clone();
    let event_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    event_orchestrator.handle_event(event).await;
                }
                _ = event_shutdown.changed() => {
                    if *event_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    let metrics_task = tokio::spawn(stapled::metrics::run(
        orchestrator.metrics.clone(),
        {
            let orchestrator = orchestrator.clone();
            move || orchestrator.queue_depths()
        },
        shutdown.clone(),
    ));

    info!("stapled running (pid {})", std::process::id());
    let result = orchestrator.run(shutdown).await;

    event_task.abort();
    metrics_task.abort();
    drop(watcher);

    info!("stapled exiting");
    result
}

fn load_trust_store(path: &std::path::Path) -> Result<rustls::RootCertStore> {
    let pem = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    let mut store = rustls::RootCertStore::empty();
    let mut added = 0usize;
    for cert in rustls_pemfile::certs(&mut reader) {
        store.add(cert?)?;
        added += 1;
    }
    if added == 0 {
        anyhow::bail!("trust store at {} contains no certificates", path.display());
    }
    Ok(store)
}
