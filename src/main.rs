//! Replay engine entry point
//!
//! Loads configuration, restores per-instrument checkpoints, then feeds a
//! JSONL record file through the router task:
//! 1. Load configuration and checkpoints
//! 2. Spawn the router task
//! 3. Stream records from the feed file in order
//! 4. Log emitted snapshots until the feed ends or Ctrl+C

use std::path::Path;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

use replay_core::config;
use replay_core::core::{
    router_task, ChannelBundle, FileCheckpointStore, InstanceRouter, Record,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenvy::dotenv().ok();

    config::logging::init_logging();

    info!("replay engine starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = match config::load_config(Path::new(&config_path)) {
        Ok(cfg) => {
            info!(
                instruments = cfg.instruments.len(),
                warmup = cfg.checkpoint.warmup_cycles,
                "[CONFIG] loaded from {}",
                config_path
            );
            cfg
        }
        Err(e) => {
            error!("[CONFIG] failed to load: {}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(FileCheckpointStore::new(&config.checkpoint.dir));
    let mut router = InstanceRouter::new(
        config.instruments.clone(),
        config.checkpoint.warmup_cycles,
        config.tolerances.clone(),
    );
    router.restore_all(store.as_ref())?;

    let bundle = ChannelBundle::default();
    let mut outputs = bundle.subscribe_outputs();

    let router_handle = tokio::spawn(router_task(
        bundle.record_rx,
        router,
        store,
        bundle.output_tx.clone(),
        bundle.shutdown_tx.subscribe(),
    ));

    // Ctrl+C -> broadcast shutdown
    let shutdown_signal = bundle.shutdown_tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("[SHUTDOWN] graceful shutdown initiated");
                let _ = shutdown_signal.send(());
            }
            Err(err) => {
                eprintln!("Failed to listen for Ctrl+C signal: {}", err);
            }
        }
    });

    // Log emitted snapshots
    tokio::spawn(async move {
        while let Ok(snapshot) = outputs.recv().await {
            let boundary = chrono::DateTime::from_timestamp(snapshot.identity.time_mark, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| snapshot.identity.time_mark.to_string());
            info!(
                instrument = %snapshot.identity.instrument,
                boundary = %boundary,
                cycle = snapshot.require_int("cycle_index").unwrap_or(-1),
                "snapshot emitted"
            );
        }
    });

    // Feed records from the JSONL file, one per line, in file order.
    let feed_path =
        std::env::var("RECORDS_FILE").unwrap_or_else(|_| "data/records.jsonl".to_string());
    info!("[FEED] streaming records from {}", feed_path);

    let file = File::open(&feed_path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut fed: u64 = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "[FEED] skipping malformed line");
                continue;
            }
        };
        if bundle.record_tx.send(record).await.is_err() {
            warn!("[FEED] router stopped, ending feed");
            break;
        }
        fed += 1;
    }
    info!(records = fed, "[FEED] feed complete");

    // Closing the sender lets the router drain and stop on its own.
    drop(bundle.record_tx);
    router_handle.await?;

    info!("[SHUTDOWN] clean exit");
    Ok(())
}
