//! Cycle aggregation: boundary detection and readiness gating
//!
//! One aggregator per instrument. Every incoming record, whatever its source
//! kind, is run through the same advancement check; the cycle closes only
//! when the time mark advances past the last boundary and every required
//! source has reported for the closing cycle. Checking advancement inside a
//! single source's branch would let a cycle silently never close, and closing
//! without the readiness gate would close it with partial data.

use tracing::{debug, warn};

use crate::core::record::SourceKind;
use crate::error::{EngineError, Result};

/// Aggregator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// No record seen yet for this instrument
    AwaitingFirst,
    /// Accumulating readiness at the current boundary
    InCycle,
}

/// What the caller should do with the record that was just observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDecision {
    /// First record for this instrument: seed the state, no real update
    Initialized,
    /// Same boundary: readiness recorded, nothing to run
    Accumulated,
    /// Time advanced with all required sources ready: run the state update
    /// for the cycle that just closed
    Closed { boundary: i64 },
    /// Time advanced but a required source never reported; the boundary
    /// moves forward so the next comparison point is not lost, and no
    /// update fires
    AdvancedIncomplete { boundary: i64 },
}

/// Per-instrument boundary tracker with per-source readiness flags.
#[derive(Debug)]
pub struct CycleAggregator {
    instrument: String,
    phase: CyclePhase,
    last_boundary: i64,
    required: Vec<SourceKind>,
    ready: Vec<bool>,
}

impl CycleAggregator {
    /// # Arguments
    /// * `instrument` - display identity used in ordering diagnostics
    /// * `required` - source kinds that must all report before a cycle closes
    pub fn new(instrument: impl Into<String>, required: Vec<SourceKind>) -> Self {
        let ready = vec![false; required.len()];
        Self {
            instrument: instrument.into(),
            phase: CyclePhase::AwaitingFirst,
            last_boundary: 0,
            required,
            ready,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn last_boundary(&self) -> i64 {
        self.last_boundary
    }

    /// Re-enter a running cycle at a persisted cursor during resume. All
    /// readiness flags start cleared; replayed records re-mark them, which
    /// is idempotent.
    pub fn resume_at(&mut self, boundary: i64) {
        self.phase = CyclePhase::InCycle;
        self.last_boundary = boundary;
        self.ready.iter_mut().for_each(|r| *r = false);
    }

    /// Observe one record's (kind, time_mark) and decide what it means for
    /// the cycle. Called exactly once per incoming record, before any state
    /// update, for every source kind alike.
    ///
    /// # Edge Cases
    /// * A regressing time mark is `OutOfOrderRecord`; delivery order is an
    ///   ingestion contract, not something the core repairs.
    /// * A kind outside the required set still drives advancement but never
    ///   contributes a readiness flag.
    pub fn observe(&mut self, kind: SourceKind, time_mark: i64) -> Result<CycleDecision> {
        if self.phase == CyclePhase::AwaitingFirst {
            self.phase = CyclePhase::InCycle;
            self.last_boundary = time_mark;
            self.mark_ready(kind);
            debug!(
                instrument = %self.instrument,
                boundary = time_mark,
                "first record, cycle initialized"
            );
            return Ok(CycleDecision::Initialized);
        }

        if time_mark < self.last_boundary {
            return Err(EngineError::OutOfOrderRecord {
                instrument: self.instrument.clone(),
                last: self.last_boundary,
                got: time_mark,
            });
        }

        if time_mark == self.last_boundary {
            self.mark_ready(kind);
            return Ok(CycleDecision::Accumulated);
        }

        // Time advanced. Capture readiness for the cycle being left behind,
        // then move the boundary and restart the flags with this record.
        let all_ready = self.ready.iter().all(|r| *r);
        self.last_boundary = time_mark;
        self.ready.iter_mut().for_each(|r| *r = false);
        self.mark_ready(kind);

        if all_ready {
            Ok(CycleDecision::Closed {
                boundary: time_mark,
            })
        } else {
            warn!(
                instrument = %self.instrument,
                boundary = time_mark,
                "cycle advanced with incomplete sources, skipping update"
            );
            Ok(CycleDecision::AdvancedIncomplete {
                boundary: time_mark,
            })
        }
    }

    fn mark_ready(&mut self, kind: SourceKind) {
        if let Some(pos) = self.required.iter().position(|k| *k == kind) {
            self.ready[pos] = true;
        }
    }
}
