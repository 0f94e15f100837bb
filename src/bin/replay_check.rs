//! Split-resume consistency checker
//!
//! Runs a record feed twice: once continuously, and once split at a cut
//! point with a checkpoint/restore in between. Snapshots emitted past the
//! warm-up threshold must agree within the configured tolerances; any
//! divergence is reported and the process exits nonzero.
//!
//! Usage: `replay_check [config.yaml] [records.jsonl] [split-fraction]`

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use tracing::{error, info};

use replay_core::config::{self, EngineConfig};
use replay_core::core::{
    CheckpointStore, FileCheckpointStore, InstanceRouter, Record,
};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    config::logging::init_logging();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.yaml".to_string());
    let feed_path = args.next().unwrap_or_else(|| "data/records.jsonl".to_string());
    let split: f64 = args
        .next()
        .map(|s| s.parse())
        .transpose()
        .context("split fraction must be a number in (0, 1)")?
        .unwrap_or(0.5);
    if !(0.0..1.0).contains(&split) || split == 0.0 {
        bail!("split fraction must be in (0, 1), got {split}");
    }

    let cfg = config::load_config(Path::new(&config_path))?;
    let records = read_feed(&feed_path)?;
    if records.is_empty() {
        bail!("feed '{feed_path}' contains no records");
    }
    let cut = ((records.len() as f64) * split) as usize;
    info!(
        records = records.len(),
        cut,
        "comparing continuous run against split-resume run"
    );

    let continuous = run(&cfg, new_router(&cfg), &records)?;

    // First half, checkpointing into a scratch directory as it goes.
    let scratch = std::env::temp_dir().join(format!("replay_check_{}", std::process::id()));
    let store = FileCheckpointStore::new(&scratch);
    let mut first = new_router(&cfg);
    let mut min_cursor = i64::MAX;
    for record in &records[..cut] {
        for snapshot in first.deliver(record)? {
            first.save_checkpoint(&snapshot.identity.instrument, &store)?;
        }
    }
    for instrument_cfg in &cfg.instruments {
        if let Some(checkpoint) = store.load(&instrument_cfg.instrument_id())? {
            min_cursor = min_cursor.min(checkpoint.cursor);
        }
    }
    if min_cursor == i64::MAX {
        bail!("no checkpoint was written before the cut point; feed too short");
    }

    // Second half: restore, then replay inputs from the cursor onward.
    let mut resumed_router = new_router(&cfg);
    resumed_router.restore_all(&store)?;
    let replay_from = records
        .iter()
        .position(|r| r.identity.time_mark >= min_cursor)
        .unwrap_or(cut);
    let resumed = run(&cfg, resumed_router, &records[replay_from..])?;
    let _ = fs::remove_dir_all(&scratch);

    let mismatches = compare(&cfg, &continuous, &resumed);
    if mismatches == 0 {
        info!("split-resume run matches the continuous run");
        Ok(())
    } else {
        error!(mismatches, "split-resume run diverged from the continuous run");
        std::process::exit(1);
    }
}

fn new_router(cfg: &EngineConfig) -> InstanceRouter {
    InstanceRouter::new(
        cfg.instruments.clone(),
        cfg.checkpoint.warmup_cycles,
        cfg.tolerances.clone(),
    )
}

fn read_feed(path: &str) -> anyhow::Result<Vec<Record>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading feed '{path}'"))?;
    let mut records = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record =
            serde_json::from_str(line).with_context(|| format!("feed line {}", i + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Deliver every record, collecting emitted snapshots keyed by
/// (routing key, cycle index). The first `warmup_cycles` emissions of each
/// instrument are run-local warm-up and allowed to diverge, so they are
/// not collected.
fn run(
    cfg: &EngineConfig,
    mut router: InstanceRouter,
    records: &[Record],
) -> anyhow::Result<HashMap<((String, String), i64), Record>> {
    let warmup = cfg.checkpoint.warmup_cycles;
    let mut outputs = HashMap::new();
    let mut emitted: HashMap<(String, String), u64> = HashMap::new();
    for record in records {
        for snapshot in router.deliver(record)? {
            let key = snapshot.identity.instrument.routing_key();
            let count = emitted.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count <= warmup {
                continue;
            }
            let cycle = snapshot.require_int("cycle_index")?;
            outputs.insert((key, cycle), snapshot);
        }
    }
    Ok(outputs)
}

fn compare(
    cfg: &EngineConfig,
    continuous: &HashMap<((String, String), i64), Record>,
    resumed: &HashMap<((String, String), i64), Record>,
) -> u64 {
    let t = &cfg.tolerances;
    let mut mismatches = 0;
    for (key, resumed_snapshot) in resumed {
        let Some(reference) = continuous.get(key) else {
            error!(
                instrument = %format!("{}:{}", key.0 .0, key.0 .1),
                cycle = key.1,
                "resumed run emitted a cycle the continuous run never produced"
            );
            mismatches += 1;
            continue;
        };
        for (name, value) in resumed_snapshot.fields() {
            let (Some(a), Some(b)) = (
                value.as_float(),
                reference.field(name).and_then(|v| v.as_float()),
            ) else {
                continue;
            };
            let (abs_tol, rel_tol) = if is_price_field(name) {
                (t.price_abs, t.price_rel)
            } else {
                (t.indicator_abs, t.indicator_rel)
            };
            let diff = (a - b).abs();
            if diff > abs_tol && diff > rel_tol * a.abs().max(b.abs()) {
                error!(
                    cycle = key.1,
                    field = %name,
                    resumed = a,
                    continuous = b,
                    "field diverged"
                );
                mismatches += 1;
            }
        }
    }
    mismatches
}

fn is_price_field(name: &str) -> bool {
    matches!(
        name,
        "open" | "high" | "low" | "close" | "volume" | "prev_close" | "rolling_high"
            | "rolling_low"
    )
}
