mod routes;
mod stream;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use starling_recorder::{
    load_config, recover_orphans, ChannelDirectory, EmptyDirectory, EventHub, Recorder,
};
use starling_store::RecordingStore;

use crate::routes::{router, AppState};

#[derive(Debug, Parser)]
#[command(name = "starlingd", about = "Channel recording daemon")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "starling.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "starling=debug,info".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    let config_dir = args
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let root = config.recording.root(&config_dir);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("failed to create recording root {}", root.display()))?;
    let root = root
        .canonicalize()
        .context("failed to canonicalize recording root")?;

    let store = Arc::new(
        RecordingStore::open(&root.join("index.sqlite")).context("failed to open the index")?,
    );

    // Close out whatever a previous run left open before anything new starts.
    let report = recover_orphans(&root, config.bot.id, &store, &config.recording);
    if report.failed > 0 {
        error!(failed = report.failed, "some orphans could not be recovered");
    }

    // The voice-client layer plugs its clientlist in here; until it does the
    // channel reads as empty and only the HTTP surface is live.
    let directory: Arc<dyn ChannelDirectory> = Arc::new(EmptyDirectory);
    let recorder = Recorder::new(
        config.bot.id,
        root.clone(),
        config.recording.clone(),
        store.clone(),
        directory,
    );
    let hub = EventHub::new();
    recorder.attach_hub(&hub);
    let ticker = recorder.spawn_ticker();

    let state = AppState {
        bot_id: config.bot.id,
        root,
        store,
        recorder: recorder.clone(),
    };

    let addr: SocketAddr = config
        .bot
        .api_bind
        .parse()
        .with_context(|| format!("failed to parse bind address {}", config.bot.api_bind))?;
    let server = axum::Server::bind(&addr).serve(router(state).into_make_service());
    info!("recording API on http://{addr}");

    let graceful = server.with_graceful_shutdown(async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    });
    if let Err(e) = graceful.await {
        error!("server error: {e}");
    }

    recorder.dispose();
    let _ = ticker.join();
    Ok(())
}
