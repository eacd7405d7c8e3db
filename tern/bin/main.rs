#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tern::Config;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file. Looked up from `TERN_CONFIG`, the working
    /// directory and `/etc/tern` when not given.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Check the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let config = Config::from_ron(&config_content)?;

    if args.check {
        let table = config.recipient_table()?;
        config.filter_chain(Arc::new(table), None)?;
        println!("{}: OK", config_path.display());
        return Ok(());
    }

    tern::controller::run(config).await
}

/// Find the configuration file using the following precedence:
/// 1. `TERN_CONFIG` environment variable
/// 2. ./tern.config.ron (current working directory)
/// 3. /etc/tern/tern.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("TERN_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("TERN_CONFIG points to non-existent file: {}", path.display());
    }

    let default_paths = [
        PathBuf::from("./tern.config.ron"),
        PathBuf::from("/etc/tern/tern.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - TERN_CONFIG environment variable\n{paths_tried}"
    )
}
