//! Instance routing: one isolated pipeline per instrument
//!
//! The router owns a map from routing key (market, commodity root) to an
//! `InstrumentPipeline` holding that instrument's decoders, cycle aggregator,
//! state and resume verifier. No component is ever shared between two
//! instruments; isolation is structural, not lock-based.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::{InstrumentConfig, ToleranceConfig};
use crate::core::checkpoint::{Checkpoint, CheckpointStore, ResumeVerifier};
use crate::core::cycle::{CycleAggregator, CycleDecision};
use crate::core::decode::{QuoteView, ReferenceView, SourceDecoder};
use crate::core::record::{InstrumentId, Record, SourceKind};
use crate::core::state::InstanceState;
use crate::error::Result;

/// The complete processing tuple for one instrument.
pub struct InstrumentPipeline {
    config: InstrumentConfig,
    quote_decoder: SourceDecoder<QuoteView>,
    reference_decoder: SourceDecoder<ReferenceView>,
    aggregator: CycleAggregator,
    state: InstanceState,
    verifier: ResumeVerifier,
    /// Exact identity of the most recent quote record; snapshots are
    /// stamped with it so outputs carry the code form actually seen
    instrument: InstrumentId,
    /// Quote decoded at the current boundary, if any, with its time mark
    latest_quote: Option<(QuoteView, i64)>,
    latest_reference: Option<f64>,
    /// A cycle closed but the new boundary's quote has not arrived yet
    update_due: bool,
}

impl InstrumentPipeline {
    pub fn new(
        config: InstrumentConfig,
        warmup_cycles: u64,
        tolerances: ToleranceConfig,
    ) -> Self {
        let instrument = InstrumentId::new(&config.market, &config.code);
        let aggregator =
            CycleAggregator::new(instrument.to_string(), config.required_sources.clone());
        let state = InstanceState::new(&config.periods);
        Self {
            quote_decoder: SourceDecoder::new(),
            reference_decoder: SourceDecoder::new(),
            aggregator,
            state,
            verifier: ResumeVerifier::new(warmup_cycles, tolerances),
            instrument,
            latest_quote: None,
            latest_reference: None,
            update_due: false,
            config,
        }
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn verifier(&self) -> &ResumeVerifier {
        &self.verifier
    }

    /// Current persistable view of this pipeline.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        if !self.state.initialized {
            return None;
        }
        Some(Checkpoint {
            instrument: self.instrument.clone(),
            cursor: self.state.last_time_mark,
            state: self.state.clone(),
        })
    }

    /// Re-enter a persisted run: the state comes back verbatim and the
    /// aggregator resumes mid-cycle at the cursor. The verifier is left at
    /// its run-local zero so warm-up happens again.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        info!(
            instrument = %checkpoint.instrument,
            cursor = checkpoint.cursor,
            cycle = checkpoint.state.cycle_index,
            "restoring from checkpoint"
        );
        self.instrument = checkpoint.instrument;
        self.aggregator.resume_at(checkpoint.cursor);
        self.state = checkpoint.state;
    }

    /// Process one record routed to this instrument. Returns the snapshot
    /// record emitted if a cycle's update ran.
    pub fn handle(&mut self, record: &Record) -> Result<Option<Record>> {
        let kind = record.identity.source_kind;
        let time_mark = record.identity.time_mark;

        // Decode before the advancement check so a malformed record is
        // rejected without disturbing the cycle.
        match kind {
            SourceKind::Quote => {
                self.quote_decoder.bind(
                    record.identity.instrument.clone(),
                    record.identity.period_seconds,
                );
                let view = self.quote_decoder.decode(record)?;
                self.instrument = record.identity.instrument.clone();

                let decision = self.aggregator.observe(kind, time_mark)?;
                if !self.state.initialized {
                    self.state.seed(&view, &self.config.periods, time_mark)?;
                    return Ok(None);
                }
                self.latest_quote = Some((view, time_mark));
                if let CycleDecision::Closed { .. } = decision {
                    self.update_due = true;
                }
            }
            SourceKind::Reference => {
                self.reference_decoder.bind(
                    record.identity.instrument.clone(),
                    record.identity.period_seconds,
                );
                let view = self.reference_decoder.decode(record)?;

                let decision = self.aggregator.observe(kind, time_mark)?;
                self.latest_reference = Some(view.value);
                if let CycleDecision::Closed { .. } = decision {
                    self.update_due = true;
                }
            }
            SourceKind::Snapshot => {
                self.aggregator.observe(kind, time_mark)?;
                self.verifier
                    .on_snapshot(&mut self.state, record, &self.config.periods)?;
                return Ok(None);
            }
        }

        self.flush_due_update()
    }

    /// Run the pending cycle update once the new boundary's quote is in.
    fn flush_due_update(&mut self) -> Result<Option<Record>> {
        if !self.update_due {
            return Ok(None);
        }
        let boundary = self.aggregator.last_boundary();
        let Some((quote, quote_mark)) = self.latest_quote else {
            return Ok(None);
        };
        if quote_mark != boundary {
            return Ok(None);
        }

        self.update_due = false;
        self.state
            .update(&quote, self.latest_reference, &self.config.periods, boundary)?;
        self.verifier.on_cycle_closed();
        Ok(Some(
            self.state
                .to_snapshot_record(&self.instrument, self.config.period_seconds),
        ))
    }
}

/// Dispatches records to per-instrument pipelines by (market, root) key.
pub struct InstanceRouter {
    pipelines: HashMap<(String, String), InstrumentPipeline>,
}

impl InstanceRouter {
    pub fn new(
        instruments: Vec<InstrumentConfig>,
        warmup_cycles: u64,
        tolerances: ToleranceConfig,
    ) -> Self {
        let mut pipelines = HashMap::new();
        for config in instruments {
            let key = InstrumentId::new(&config.market, &config.code).routing_key();
            pipelines.insert(
                key,
                InstrumentPipeline::new(config, warmup_cycles, tolerances.clone()),
            );
        }
        Self { pipelines }
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn pipeline(&self, instrument: &InstrumentId) -> Option<&InstrumentPipeline> {
        self.pipelines.get(&instrument.routing_key())
    }

    /// Load every registered instrument's checkpoint, if present.
    pub fn restore_all(&mut self, store: &dyn CheckpointStore) -> Result<()> {
        for pipeline in self.pipelines.values_mut() {
            let instrument =
                InstrumentId::new(&pipeline.config.market, &pipeline.config.code);
            if let Some(checkpoint) = store.load(&instrument)? {
                pipeline.restore(checkpoint);
            }
        }
        Ok(())
    }

    /// Route one record to its pipeline. Records matching no registered
    /// instrument are dropped silently.
    pub fn deliver(&mut self, record: &Record) -> Result<Vec<Record>> {
        let key = record.identity.instrument.routing_key();
        let Some(pipeline) = self.pipelines.get_mut(&key) else {
            debug!(instrument = %record.identity.instrument, "no pipeline, record dropped");
            return Ok(Vec::new());
        };
        Ok(pipeline.handle(record)?.into_iter().collect())
    }

    /// Persist the current state of the instrument that just emitted.
    pub fn save_checkpoint(
        &self,
        instrument: &InstrumentId,
        store: &dyn CheckpointStore,
    ) -> Result<()> {
        if let Some(pipeline) = self.pipelines.get(&instrument.routing_key()) {
            if let Some(checkpoint) = pipeline.checkpoint() {
                store.save(&checkpoint)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndicatorPeriods;
    use crate::core::record::{FieldValue, Namespace, RecordIdentity};

    fn config(required: Vec<SourceKind>) -> InstrumentConfig {
        InstrumentConfig {
            market: "DCE".to_string(),
            code: "i<00>".to_string(),
            period_seconds: 900,
            required_sources: required,
            periods: IndicatorPeriods::default(),
        }
    }

    fn quote(code: &str, time_mark: i64, close: f64) -> Record {
        Record::new(RecordIdentity {
            source_kind: SourceKind::Quote,
            instrument: InstrumentId::new("DCE", code),
            period_seconds: 900,
            namespace: Namespace::Global,
            time_mark,
        })
        .with_field("open", FieldValue::Float(close - 1.0))
        .with_field("high", FieldValue::Float(close + 2.0))
        .with_field("low", FieldValue::Float(close - 2.0))
        .with_field("close", FieldValue::Float(close))
        .with_field("volume", FieldValue::Float(1000.0))
    }

    fn reference(time_mark: i64, value: f64) -> Record {
        Record::new(RecordIdentity {
            source_kind: SourceKind::Reference,
            instrument: InstrumentId::new("DCE", "i<00>"),
            period_seconds: 900,
            namespace: Namespace::Private,
            time_mark,
        })
        .with_field("value", FieldValue::Float(value))
    }

    fn router(required: Vec<SourceKind>) -> InstanceRouter {
        InstanceRouter::new(vec![config(required)], 1, ToleranceConfig::default())
    }

    #[test]
    fn test_first_quote_seeds_without_emitting() {
        let mut router = router(vec![SourceKind::Quote]);
        let out = router.deliver(&quote("i<00>", 900, 100.0)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_second_quote_closes_and_emits_once() {
        let mut router = router(vec![SourceKind::Quote]);
        router.deliver(&quote("i<00>", 900, 100.0)).unwrap();
        let out = router.deliver(&quote("i<00>", 1800, 110.0)).unwrap();
        assert_eq!(out.len(), 1);
        let snapshot = &out[0];
        assert_eq!(snapshot.identity.source_kind, SourceKind::Snapshot);
        assert_eq!(snapshot.identity.time_mark, 1800);
        assert_eq!(snapshot.require_int("cycle_index").unwrap(), 1);
    }

    #[test]
    fn test_ema_worked_example_through_router() {
        let mut cfg = config(vec![SourceKind::Quote]);
        cfg.periods.ema_fast = 10;
        let mut router = InstanceRouter::new(vec![cfg], 1, ToleranceConfig::default());
        router.deliver(&quote("i<00>", 900, 100.0)).unwrap();
        let out = router.deliver(&quote("i<00>", 1800, 110.0)).unwrap();
        let ema = out[0].require_float("ema_fast").unwrap();
        assert!((ema - 101.8181818181).abs() < 1e-6);
    }

    #[test]
    fn test_unmatched_record_dropped_silently() {
        let mut router = router(vec![SourceKind::Quote]);
        let out = router.deliver(&quote("i<00>", 900, 100.0)).unwrap();
        assert!(out.is_empty());
        let stray = Record::new(RecordIdentity {
            source_kind: SourceKind::Quote,
            instrument: InstrumentId::new("SHFE", "cu<00>"),
            period_seconds: 900,
            namespace: Namespace::Global,
            time_mark: 900,
        });
        assert!(router.deliver(&stray).unwrap().is_empty());
    }

    #[test]
    fn test_dated_and_continuous_codes_reach_same_pipeline() {
        let mut router = router(vec![SourceKind::Quote]);
        router.deliver(&quote("i<00>", 900, 100.0)).unwrap();
        let out = router.deliver(&quote("i2405", 1800, 110.0)).unwrap();
        assert_eq!(out.len(), 1);
        // Output carries the code form of the record that closed the cycle.
        assert_eq!(out[0].identity.instrument.code, "i2405");
    }

    #[test]
    fn test_two_required_sources_gate_emission() {
        let mut router = router(vec![SourceKind::Quote, SourceKind::Reference]);
        router.deliver(&quote("i<00>", 900, 100.0)).unwrap();
        // Reference never arrives at 900, so no close at 1800.
        let out = router.deliver(&quote("i<00>", 1800, 110.0)).unwrap();
        assert!(out.is_empty());
        // Both present at 1800, next advancement closes.
        router.deliver(&reference(1800, 0.5)).unwrap();
        let out = router.deliver(&quote("i<00>", 2700, 111.0)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].require_float("reference").unwrap(), 0.5);
    }

    #[test]
    fn test_reference_triggered_close_waits_for_quote() {
        let mut router = router(vec![SourceKind::Quote, SourceKind::Reference]);
        router.deliver(&quote("i<00>", 900, 100.0)).unwrap();
        router.deliver(&reference(900, 0.5)).unwrap();
        // Reference advances first; the update must wait for the boundary's
        // quote rather than reuse the previous bar.
        let out = router.deliver(&reference(1800, 0.6)).unwrap();
        assert!(out.is_empty());
        let out = router.deliver(&quote("i<00>", 1800, 110.0)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].require_float("close").unwrap(), 110.0);
    }

    #[test]
    fn test_instruments_stay_isolated() {
        let mut dce = config(vec![SourceKind::Quote]);
        dce.periods.ema_fast = 10;
        let shfe = InstrumentConfig {
            market: "SHFE".to_string(),
            code: "cu<00>".to_string(),
            period_seconds: 900,
            required_sources: vec![SourceKind::Quote],
            periods: IndicatorPeriods::default(),
        };
        let mut router = InstanceRouter::new(vec![dce, shfe], 1, ToleranceConfig::default());

        let cu = |time_mark: i64, close: f64| {
            Record::new(RecordIdentity {
                source_kind: SourceKind::Quote,
                instrument: InstrumentId::new("SHFE", "cu<00>"),
                period_seconds: 900,
                namespace: Namespace::Global,
                time_mark,
            })
            .with_field("open", FieldValue::Float(close))
            .with_field("high", FieldValue::Float(close))
            .with_field("low", FieldValue::Float(close))
            .with_field("close", FieldValue::Float(close))
            .with_field("volume", FieldValue::Float(1.0))
        };

        router.deliver(&quote("i<00>", 900, 100.0)).unwrap();
        router.deliver(&cu(900, 70000.0)).unwrap();
        let iron = router.deliver(&quote("i<00>", 1800, 110.0)).unwrap();
        let copper = router.deliver(&cu(1800, 70100.0)).unwrap();
        assert!((iron[0].require_float("ema_fast").unwrap() - 101.8181818181).abs() < 1e-6);
        assert!((copper[0].require_float("close").unwrap() - 70100.0).abs() < 1e-9);
    }

    #[test]
    fn test_restore_resumes_mid_cycle() {
        let mut router = router(vec![SourceKind::Quote]);
        for (i, close) in [100.0, 101.0, 102.0, 103.0].iter().enumerate() {
            router
                .deliver(&quote("i<00>", 900 + 900 * i as i64, *close))
                .unwrap();
        }
        let id = InstrumentId::new("DCE", "i<00>");
        let checkpoint = router.pipeline(&id).unwrap().checkpoint().unwrap();
        assert_eq!(checkpoint.cursor, 3600);

        let mut resumed = InstanceRouter::new(
            vec![config(vec![SourceKind::Quote])],
            1,
            ToleranceConfig::default(),
        );
        resumed
            .pipelines
            .get_mut(&id.routing_key())
            .unwrap()
            .restore(checkpoint);

        // Replayed record at the cursor accumulates; the next one closes.
        assert!(resumed.deliver(&quote("i<00>", 3600, 103.0)).unwrap().is_empty());
        let out = resumed.deliver(&quote("i<00>", 4500, 104.0)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].require_int("cycle_index").unwrap(), 4);
    }
}
