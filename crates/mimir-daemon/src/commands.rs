//! Execution of the `mimir` subcommands

// Client commands print their results to stdout
#![allow(clippy::print_stdout)]

use crate::cli::{Cli, Commands};
use crate::client::DaemonClient;
use crate::config;
use crate::error::{DaemonError, Result};
use crate::protocol::Data;
use crate::registry::{NodeRegistry, build_runtime};
use crate::server::{Daemon, DaemonConfig};
use crate::shutdown::install_signal_handlers;
use mimir_core::{Checksums, Key, Metadata, Properties, paths};
use std::path::{Path, PathBuf};

/// Run the parsed command line.
///
/// # Errors
///
/// Returns the first error of the command; the caller maps it to an exit code.
pub async fn execute(cli: Cli) -> Result<()> {
    let properties = config::load(cli.config.as_deref(), &cli.properties).await?;
    match cli.command {
        Commands::Daemon => run_daemon(&properties).await,
        Commands::Locate { key } => locate(&properties, &parse_key(&key)?).await,
        Commands::Transfer { key, dest } => {
            let key = parse_key(&key)?;
            let dest = absolute(&dest)?;
            let mut client = connect(&properties).await?;
            client.transfer(&key, &dest).await?;
            client.bye(false).await?;
            println!("{}", dest.display());
            Ok(())
        }
        Commands::Store { key, path } => {
            let key = parse_key(&key)?;
            let source = absolute(&path)?;
            let mut client = connect(&properties).await?;
            let stored = client
                .store_path(&key, &source, &Metadata::new(), &Checksums::new())
                .await?;
            client.bye(false).await?;
            print_map(&stored.to_merged());
            Ok(())
        }
        Commands::Checksums => {
            let mut client = connect(&properties).await?;
            let algorithms = client.ls_checksums().await?;
            client.bye(false).await?;
            for algorithm in algorithms {
                println!("{algorithm}");
            }
            Ok(())
        }
        Commands::Preseed { bundle, keys } => {
            let bundle = absolute(&bundle)?;
            let keys = keys
                .iter()
                .map(|k| parse_key(k))
                .collect::<Result<Vec<_>>>()?;
            let mut client = connect(&properties).await?;
            let report = client.preseed(&bundle, &keys).await?;
            client.bye(false).await?;
            println!("stored={} skipped={}", report.stored, report.skipped);
            Ok(())
        }
        Commands::Shutdown => {
            let client = connect(&properties).await?;
            client.bye(true).await?;
            println!("daemon shutting down");
            Ok(())
        }
        Commands::Status => {
            let socket = paths::socket_path(&properties)?;
            let client = DaemonClient::connect(&socket, client_data()).await?;
            println!(
                "running: version {} at {}",
                client.daemon_version().unwrap_or("unknown"),
                socket.display()
            );
            client.bye(false).await
        }
    }
}

async fn run_daemon(properties: &Properties) -> Result<()> {
    let registry = NodeRegistry::with_defaults();
    let config = DaemonConfig::from_properties(properties)?;
    let runtime = build_runtime(&registry, properties).await?;
    let daemon = Daemon::new(config, runtime);
    let signals = install_signal_handlers(daemon.shutdown_token());
    let outcome = daemon.run().await;
    daemon.shutdown();
    if let Err(e) = signals.await {
        tracing::debug!(error = %e, "Signal watcher ended abnormally");
    }
    outcome
}

async fn locate(properties: &Properties, key: &Key) -> Result<()> {
    let mut client = connect(properties).await?;
    let found = client.locate(key).await?;
    client.bye(false).await?;
    match found {
        Some(info) => {
            print_map(&info.to_merged());
            Ok(())
        }
        None => Err(DaemonError::NotFound {
            key: key.to_string(),
        }),
    }
}

async fn connect(properties: &Properties) -> Result<DaemonClient> {
    DaemonClient::connect(paths::socket_path(properties)?, client_data()).await
}

fn client_data() -> Data {
    Data::from([
        ("client".to_string(), "mimir-cli".to_string()),
        ("pid".to_string(), std::process::id().to_string()),
    ])
}

fn parse_key(raw: &str) -> Result<Key> {
    Ok(raw.parse()?)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| DaemonError::io(e, path, "resolve path"))
}

fn print_map(map: &Data) {
    for (name, value) in map {
        println!("{name}={value}");
    }
}
