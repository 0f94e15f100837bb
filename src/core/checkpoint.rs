//! Checkpoint persistence and the two-phase resume protocol
//!
//! A checkpoint is the full instance state plus the cursor it was taken at.
//! Saving happens once per closed cycle, loading once at startup. The
//! `ResumeVerifier` drives what replayed snapshot records mean for a live
//! instrument: during warm-up they are loaded straight into live state, and
//! after warm-up they become assertions that the live computation reproduced
//! the persisted history.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{IndicatorPeriods, ToleranceConfig};
use crate::core::record::{InstrumentId, Record};
use crate::core::state::InstanceState;
use crate::error::{EngineError, Result};

/// Persisted unit: one instrument's state at a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instrument: InstrumentId,
    /// Boundary the state had reached when saved. Resume feeds the input
    /// stream back in from this time mark onward.
    pub cursor: i64,
    pub state: InstanceState,
}

/// Storage boundary for checkpoints. Loads and saves are discrete scoped
/// operations; nothing here interleaves with cycle processing.
pub trait CheckpointStore {
    fn load(&self, instrument: &InstrumentId) -> Result<Option<Checkpoint>>;
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// One JSON file per instrument under a configured directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, instrument: &InstrumentId) -> PathBuf {
        let sanitized: String = format!("{}_{}", instrument.market, instrument.code)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, instrument: &InstrumentId) -> Result<Option<Checkpoint>> {
        let path = self.path_for(instrument);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&raw).map_err(|e| {
            EngineError::Checkpoint(format!(
                "corrupt checkpoint at {}: {e}",
                path.display()
            ))
        })?;
        debug!(
            instrument = %instrument,
            cursor = checkpoint.cursor,
            "checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&checkpoint.instrument);
        let tmp = tmp_path(&path);
        fs::write(&tmp, serde_json::to_string_pretty(checkpoint)?)?;
        // Rename is atomic on the same filesystem, so readers never observe
        // a half-written checkpoint.
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Resume phase for one instrument within the current process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePhase {
    /// Run-local cycle count below the warm-up threshold: replayed
    /// snapshots overwrite live state, no assertions
    Rebuilding,
    /// Warm-up complete: replayed snapshots are verified against live state
    Reconciling,
}

/// Tracks run-local warm-up progress and applies the phase-appropriate
/// treatment to replayed snapshot records.
#[derive(Debug)]
pub struct ResumeVerifier {
    /// Cycles closed since this process started. Deliberately separate from
    /// the persisted `cycle_index`, which already counts pre-restart history
    /// and would make warm-up appear instantly finished.
    run_cycles: u64,
    warmup_cycles: u64,
    tolerances: ToleranceConfig,
}

impl ResumeVerifier {
    pub fn new(warmup_cycles: u64, tolerances: ToleranceConfig) -> Self {
        Self {
            run_cycles: 0,
            warmup_cycles,
            tolerances,
        }
    }

    pub fn phase(&self) -> ResumePhase {
        if self.run_cycles < self.warmup_cycles {
            ResumePhase::Rebuilding
        } else {
            ResumePhase::Reconciling
        }
    }

    pub fn run_cycles(&self) -> u64 {
        self.run_cycles
    }

    /// Count one closed cycle toward warm-up.
    pub fn on_cycle_closed(&mut self) {
        self.run_cycles += 1;
        if self.run_cycles == self.warmup_cycles {
            info!(
                warmup = self.warmup_cycles,
                "warm-up complete, snapshot verification active"
            );
        }
    }

    /// Apply a replayed snapshot record to `live` according to the current
    /// phase.
    ///
    /// # Edge Cases
    /// * Rebuilding: the snapshot is decoded into the live state itself and
    ///   nothing is asserted; transient divergence here is expected.
    /// * Reconciling: the snapshot is decoded into a detached state and
    ///   compared field by field; any mismatch is fatal.
    pub fn on_snapshot(
        &self,
        live: &mut InstanceState,
        record: &Record,
        params: &IndicatorPeriods,
    ) -> Result<()> {
        match self.phase() {
            ResumePhase::Rebuilding => {
                live.ingest(record, params)?;
                debug!(
                    cycle = live.cycle_index,
                    run_cycles = self.run_cycles,
                    "snapshot ingested during rebuild"
                );
                Ok(())
            }
            ResumePhase::Reconciling => {
                let persisted = InstanceState::load_raw(record, params)?;
                live.compare(&persisted, &self.tolerances)
            }
        }
    }
}
