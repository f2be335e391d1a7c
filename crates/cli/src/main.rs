use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kmerge_core::Kind;
use kmerge_kubehub::SecretStore;
use kmerge_reconcile::Controller;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod offline;

use config::{RunArgs, Settings};

#[derive(Parser, Debug)]
#[command(name = "kmerged", version, about = "Merge tagged Secrets into their primaries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run(RunArgs),
    /// Merge local files with one strategy and print the result
    Merge {
        /// raw, json or yaml
        #[arg(long, default_value_t = Kind::Raw)]
        kind: Kind,
        /// Inputs in merge order; later files win
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the content hash of a payload given as KEY=FILE entries
    Hash {
        #[arg(required = true, value_parser = offline::parse_entry)]
        entries: Vec<(String, PathBuf)>,
    },
}

fn init_tracing() {
    let env = std::env::var("KMERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid metrics address; expected host:port"),
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("waiting for Ctrl-C")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let settings = Settings::resolve(&args);
    init_metrics(settings.metrics_addr.as_deref());
    let client = kmerge_kubehub::get_kube_client().await?;

    let shutdown = CancellationToken::new();
    let store = Arc::new(SecretStore::new(client.clone()));
    let controller = Controller::start(store, settings.controller.clone(), shutdown.clone());

    let (tx, rx) = mpsc::channel(settings.controller.queue_capacity);
    let watcher = tokio::spawn({
        let ns = settings.namespace.clone();
        async move {
            if let Err(e) = kmerge_kubehub::start_watcher(client, ns.as_deref(), tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });
    info!(ns = ?settings.namespace, "kmerged running");

    tokio::select! {
        _ = controller.run(rx) => warn!("event loop ended before shutdown"),
        res = wait_for_signal() => match res {
            Ok(()) => info!("signal received; shutting down"),
            Err(e) => error!(error = ?e, "signal handling failed; shutting down"),
        },
    }

    shutdown.cancel();
    watcher.abort();
    if !controller.shutdown(settings.shutdown_grace).await {
        warn!("exiting with merges still in flight");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Merge { kind, files } => {
            let merged = offline::merge_files(kind, &files)?;
            std::io::stdout().lock().write_all(&merged).context("writing merged output")?;
        }
        Commands::Hash { entries } => {
            println!("{}", offline::hash_entries(&entries)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_offline_subcommands() {
        let cli = Cli::try_parse_from(["kmerged", "merge", "--kind", "yml", "a.yaml", "b.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Merge { kind: Kind::Yaml, ref files } if files.len() == 2));

        let cli = Cli::try_parse_from(["kmerged", "hash", "k=a.bin"]).unwrap();
        assert!(matches!(cli.command, Commands::Hash { ref entries } if entries[0].0 == "k"));

        assert!(Cli::try_parse_from(["kmerged", "merge", "--kind", "toml", "a"]).is_err());
        assert!(Cli::try_parse_from(["kmerged", "hash", "nokey"]).is_err());
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from(["kmerged", "run", "--workers", "7", "--min-interval-ms", "50"]).unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        assert_eq!(args.workers, Some(7));
        assert_eq!(args.min_interval_ms, Some(50));
    }
}
