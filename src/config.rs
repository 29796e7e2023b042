//! Configuration management for the staple daemon.
//!
//! External CLI/config loading is named as an out-of-scope collaborator
//! by the core engine, but a daemon still needs somewhere to load its
//! knobs from. Loading precedence mirrors the rest of the family: an
//! explicit `--config` path, then a system path, then a user config
//! directory fallback; any path that doesn't exist yet gets a written
//! default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Knobs handed to the Staple Acquirer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquirerConfig {
    /// Per-URL retry cap.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    /// Linear back-off step in seconds.
    #[serde(default = "default_retry_backoff_step_seconds")]
    pub retry_backoff_step_seconds: u64,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            retry_max: default_retry_max(),
            retry_backoff_step_seconds: default_retry_backoff_step_seconds(),
        }
    }
}

fn default_retry_max() -> u32 {
    3
}
fn default_retry_backoff_step_seconds() -> u64 {
    5
}

/// Top-level daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directories to watch for certificate files.
    pub watch_paths: Vec<PathBuf>,

    /// Recognized certificate file extensions.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Watcher sweep period in seconds (health-check / rescan cadence).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,

    #[serde(flatten)]
    pub acquirer: AcquirerConfig,

    /// Parser worker pool size.
    #[serde(default = "default_parser_workers")]
    pub parser_workers: usize,

    /// Renewer worker pool size.
    #[serde(default = "default_renewer_workers")]
    pub renewer_workers: usize,

    /// PEM bundle of trusted roots used for path validation.
    pub trust_store_path: PathBuf,

    /// Worker restart cap before the process exits non-zero.
    #[serde(default = "default_max_thread_restarts")]
    pub max_thread_restarts: u32,

    /// Renewal scheduling margin before `staple_valid_until`.
    #[serde(default = "default_refresh_margin_seconds")]
    pub refresh_margin_seconds: i64,

    /// Maximum consecutive acquisition failures before a record is
    /// dropped until re-parsed.
    #[serde(default = "default_max_acquire_failures")]
    pub max_acquire_failures: u32,

    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_extensions() -> Vec<String> {
    vec!["crt".to_string(), "pem".to_string(), "cer".to_string()]
}
fn default_refresh_interval() -> u64 {
    60
}
fn default_parser_workers() -> usize {
    2
}
fn default_renewer_workers() -> usize {
    2
}
fn default_max_thread_restarts() -> u32 {
    3
}
fn default_refresh_margin_seconds() -> i64 {
    // Half the default 7-day OCSP responder lifetime; a concrete
    // acquirer result generally supersedes this via next_update.
    3 * 24 * 3600
}
fn default_max_acquire_failures() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_paths: Vec::new(),
            extensions: default_extensions(),
            refresh_interval_seconds: default_refresh_interval(),
            acquirer: AcquirerConfig::default(),
            parser_workers: default_parser_workers(),
            renewer_workers: default_renewer_workers(),
            trust_store_path: PathBuf::from("/etc/ssl/certs/ca-certificates.crt"),
            max_thread_restarts: default_max_thread_restarts(),
            refresh_margin_seconds: default_refresh_margin_seconds(),
            max_acquire_failures: default_max_acquire_failures(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Resolve the config path the same way a CLI-driven daemon does:
    /// explicit flag wins, then a system path, then the user config
    /// directory.
    pub fn resolve_path(explicit: Option<PathBuf>, use_system: bool) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path);
        }
        if use_system {
            return Ok(PathBuf::from("/etc/stapled/stapled.toml"));
        }
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine a user config directory"))?
            .join("stapled");
        Ok(dir.join("stapled.toml"))
    }

    /// Load from a TOML file, falling back to (and not writing) an
    /// in-memory default if the file does not exist. Callers that want
    /// the default persisted should write it themselves.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let cfg: Config = toml::from_str(&text)
                    .with_context(|| format!("parsing config at {}", path.display()))?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config not found, using defaults");
                let cfg = Config::default();
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) => Err(e).with_context(|| format!("reading config at {}", path.display())),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.watch_paths.is_empty() {
            anyhow::bail!("watch_paths must name at least one directory");
        }
        if self.parser_workers == 0 {
            anyhow::bail!("parser_workers must be greater than 0");
        }
        if self.renewer_workers == 0 {
            anyhow::bail!("renewer_workers must be greater than 0");
        }
        if self.acquirer.retry_max == 0 {
            anyhow::bail!("retry_max must be greater than 0");
        }
        if self.refresh_interval_seconds == 0 {
            anyhow::bail!("refresh_interval_seconds must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rejects_missing_watch_paths() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolve_path_prefers_explicit_flag() {
        let explicit = PathBuf::from("/tmp/custom.toml");
        let resolved = Config::resolve_path(Some(explicit.clone()), true).unwrap();
        assert_eq!(resolved, explicit);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults_with_watch_paths_invalid() {
        let path = PathBuf::from("/nonexistent/stapled-config-test.toml");
        // Defaults have empty watch_paths, which validate() rejects -
        // callers are expected to supply watch_paths even when loading
        // from a nonexistent file.
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("watch_paths"));
    }
}
