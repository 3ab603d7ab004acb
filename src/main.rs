// src/main.rs

//! The main entry point for the Kubedeck backend.

use anyhow::Result;
use kubedeck::config::Config;
use kubedeck::{execwrap, server};
use std::env;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Exec wrapper mode: passthrough for credential helpers. Checked before
    // any other flag so the wrapped command's own arguments are never
    // interpreted, and without logging setup so the child's stdio stays
    // pristine.
    if args.len() > 1 && args[1] == "--ly-exec-wrapper" {
        std::process::exit(execwrap::run(&args[2..]));
    }

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("Kubedeck backend version {VERSION}");
        return Ok(());
    }

    // --- Normal backend mode ---

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise it defaults to "kubedeck.toml". A missing default file
    // just means default configuration: the desktop shell usually drives
    // everything through the selection channel.
    let config_arg = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config = match config_arg {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        None => match Config::from_file("kubedeck.toml") {
            Ok(cfg) => cfg,
            Err(_) => Config::default(),
        },
    };

    // Setup logging with reloading capabilities. Get the initial log level
    // from the env var or the config.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true), // Enable ANSI color codes for log levels.
        )
        .init();

    if let Err(e) = server::run(config).await {
        error!("Backend runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
