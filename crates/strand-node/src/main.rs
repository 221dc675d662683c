//! Strand node daemon
//!
//! Opens one Store from its data directory and serves it over the
//! cross-store protocol until Ctrl-C, then flushes open blocks to disk.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use strand_core::StrandConfig;
use strand_rpc::RpcServer;
use strand_store::{LocalStore, TimelineStore};

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = cli.load_config(std::env::vars())?;
    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }
    run(config).await
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: StrandConfig) -> Result<()> {
    let store = Arc::new(
        TimelineStore::open(config.store.clone())
            .with_context(|| format!("opening store in {}", config.store.data_dir.display()))?,
    );
    let stats = store.stats();
    tracing::info!(
        store = %stats.store_id,
        timelines = stats.timeline_count,
        messages = stats.message_count,
        last_seq_id = stats.last_seq_id,
        "store opened"
    );

    let listener = TcpListener::bind(&config.rpc.bind)
        .await
        .with_context(|| format!("binding {}", config.rpc.bind))?;
    let server = RpcServer::new(Arc::new(LocalStore::new(store.clone())));
    server.serve(listener, shutdown_signal()).await?;

    store.flush().context("flushing store")?;
    tracing::info!(store = %stats.store_id, "store flushed, bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
