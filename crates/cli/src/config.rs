//! Daemon settings: built-in defaults, then the optional YAML file, then flags and `KMERGE_*` env.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use kmerge_reconcile::{ControllerConfig, RetryPolicy};
use serde::Deserialize;
use tracing::{info, warn};

/// Settings as they may appear in the YAML file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub namespace: Option<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub min_interval_ms: u64,
    pub patch_attempts: u32,
    pub patch_interval_ms: u64,
    pub shutdown_grace_secs: u64,
    pub metrics_addr: Option<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        let c = ControllerConfig::default();
        Self {
            namespace: None,
            workers: c.workers,
            queue_capacity: c.queue_capacity,
            min_interval_ms: c.min_interval.as_millis() as u64,
            patch_attempts: c.retry.attempts,
            patch_interval_ms: c.retry.interval.as_millis() as u64,
            shutdown_grace_secs: 10,
            metrics_addr: None,
        }
    }
}

/// Flags of `kmerged run`. Anything given here wins over the file.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// YAML settings file
    #[arg(long = "config-path", env = "KMERGE_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,
    /// Watch a single namespace instead of the whole cluster
    #[arg(long = "ns", env = "KMERGE_NAMESPACE")]
    pub namespace: Option<String>,
    /// Dispatch workers (at least 3)
    #[arg(long, env = "KMERGE_WORKERS")]
    pub workers: Option<usize>,
    #[arg(long = "queue-capacity", env = "KMERGE_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,
    /// Minimum spacing between two merges of one target, in milliseconds
    #[arg(long = "min-interval-ms", env = "KMERGE_MIN_INTERVAL_MS")]
    pub min_interval_ms: Option<u64>,
    #[arg(long = "patch-attempts", env = "KMERGE_PATCH_ATTEMPTS")]
    pub patch_attempts: Option<u32>,
    #[arg(long = "patch-interval-ms", env = "KMERGE_PATCH_INTERVAL_MS")]
    pub patch_interval_ms: Option<u64>,
    /// How long shutdown waits for in-flight merges, in seconds
    #[arg(long = "shutdown-grace-secs", env = "KMERGE_SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: Option<u64>,
    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", env = "KMERGE_METRICS_ADDR")]
    pub metrics_addr: Option<String>,
}

/// Resolved daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: Option<String>,
    pub controller: ControllerConfig,
    pub shutdown_grace: Duration,
    pub metrics_addr: Option<String>,
}

/// Read the settings file. A missing or malformed file is reported and the defaults are used.
pub fn load_file(path: &Path) -> FileConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file; using defaults");
            return FileConfig::default();
        }
    };
    if text.trim().is_empty() {
        return FileConfig::default();
    }
    match serde_yaml::from_str::<Option<FileConfig>>(&text) {
        Ok(cfg) => {
            info!(path = %path.display(), "config file loaded");
            cfg.unwrap_or_default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file; using defaults");
            FileConfig::default()
        }
    }
}

impl Settings {
    pub fn resolve(args: &RunArgs) -> Self {
        let file = args.config_path.as_deref().map(load_file).unwrap_or_default();
        Self::merge(file, args)
    }

    fn merge(file: FileConfig, args: &RunArgs) -> Self {
        let controller = ControllerConfig {
            workers: args.workers.unwrap_or(file.workers).max(kmerge_store::MIN_WORKERS),
            queue_capacity: args.queue_capacity.unwrap_or(file.queue_capacity).max(1),
            min_interval: Duration::from_millis(args.min_interval_ms.unwrap_or(file.min_interval_ms)),
            retry: RetryPolicy {
                attempts: args.patch_attempts.unwrap_or(file.patch_attempts).max(1),
                interval: Duration::from_millis(args.patch_interval_ms.unwrap_or(file.patch_interval_ms)),
            },
        };
        Self {
            namespace: args.namespace.clone().or(file.namespace).filter(|ns| !ns.is_empty()),
            controller,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs.unwrap_or(file.shutdown_grace_secs)),
            metrics_addr: args.metrics_addr.clone().or(file.metrics_addr),
        }
    }
}
