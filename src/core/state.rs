//! Per-instrument online state
//!
//! `InstanceState` owns everything the computation knows about one
//! instrument: the persisted cycle counter, the last time boundary, and the
//! indicator accumulators. It updates once per closed cycle, serializes to
//! both a checkpoint and a snapshot record, and rebuilds itself from either.
//!
//! Two distinct deserialization paths exist on purpose. `ingest` decodes a
//! snapshot record into the live state and is the path the rebuilding phase
//! hooks into; `load_raw` decodes into a fresh detached state with no side
//! effects on live data, which is what reconciliation compares against.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{IndicatorPeriods, ToleranceConfig};
use crate::core::decode::QuoteView;
use crate::core::indicators::{alpha_for_period, DecayedVariance, Ema, ExtremaRing};
use crate::core::record::{
    FieldValue, InstrumentId, Namespace, Record, RecordIdentity, SourceKind,
};
use crate::error::{EngineError, Result};

/// Tolerance class used when comparing a live field against its persisted
/// counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldClass {
    /// Integers and enumerations: exact equality
    Exact,
    /// Smoothed indicator outputs: tight tolerances
    Indicator,
    /// Raw market values (prices, volumes, extrema): looser tolerances
    Price,
}

/// Full numeric state for one instrument. Memory footprint is O(1) in run
/// length: every collection inside is capacity-bounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Total closed cycles over the instrument's whole history, persisted
    /// across restarts. Never used for warm-up accounting.
    pub cycle_index: u64,
    /// Boundary reached after the most recent close (or seed)
    pub last_time_mark: i64,
    pub initialized: bool,

    // Last closed cycle's bar
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub prev_close: Option<f64>,

    // Trend
    pub ema_fast: Ema,
    pub ema_slow: Ema,
    pub macd_signal_ema: Ema,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,

    // Momentum
    pub gain_ema: Ema,
    pub loss_ema: Ema,
    pub rsi: f64,

    // Volatility bands from decayed mean/variance
    pub bands: DecayedVariance,
    pub band_upper: f64,
    pub band_middle: f64,
    pub band_lower: f64,
    pub band_width_pct: f64,

    // True range
    pub atr_ema: Ema,
    pub atr: f64,

    pub volume_ema: Ema,

    // Rolling extrema over a fixed window of closed cycles
    pub extrema: ExtremaRing,
    pub rolling_high: f64,
    pub rolling_low: f64,

    /// Latest upstream reference value, passed through into outputs
    pub reference: Option<f64>,
}

impl InstanceState {
    pub fn new(params: &IndicatorPeriods) -> Self {
        Self {
            cycle_index: 0,
            last_time_mark: 0,
            initialized: false,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            prev_close: None,
            ema_fast: Ema::new(),
            ema_slow: Ema::new(),
            macd_signal_ema: Ema::new(),
            macd: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            // Gain/loss start at zero by definition, not at the first sample
            gain_ema: Ema::seeded_at(0.0),
            loss_ema: Ema::seeded_at(0.0),
            rsi: 50.0,
            bands: DecayedVariance::new(),
            band_upper: 0.0,
            band_middle: 0.0,
            band_lower: 0.0,
            band_width_pct: 0.0,
            atr_ema: Ema::new(),
            atr: 0.0,
            volume_ema: Ema::new(),
            extrema: ExtremaRing::new(params.extrema_capacity),
            rolling_high: 0.0,
            rolling_low: 0.0,
            reference: None,
        }
    }

    /// Initialize accumulators from the first observed bar. This is seeding,
    /// not an update: the cycle counter stays at zero.
    pub fn seed(
        &mut self,
        quote: &QuoteView,
        params: &IndicatorPeriods,
        boundary: i64,
    ) -> Result<()> {
        self.ema_fast.update(alpha_for_period(params.ema_fast), quote.close);
        self.ema_slow.update(alpha_for_period(params.ema_slow), quote.close);
        self.bands.update(alpha_for_period(params.bands), quote.close);
        self.band_middle = self.bands.mean;
        self.band_upper = self.bands.mean;
        self.band_lower = self.bands.mean;
        self.volume_ema
            .update(alpha_for_period(params.volume), quote.volume);
        self.extrema.push(quote.high, quote.low)?;
        self.rolling_high = quote.high;
        self.rolling_low = quote.low;

        self.open = quote.open;
        self.high = quote.high;
        self.low = quote.low;
        self.close = quote.close;
        self.volume = quote.volume;
        self.prev_close = Some(quote.close);
        self.last_time_mark = boundary;
        self.initialized = true;
        Ok(())
    }

    /// Apply one closed cycle's bar and optional reference value.
    ///
    /// # Arguments
    /// * `boundary` - the time mark the cycle advanced to; recorded as the
    ///   new cursor and stamped onto the emitted snapshot
    pub fn update(
        &mut self,
        quote: &QuoteView,
        reference: Option<f64>,
        params: &IndicatorPeriods,
        boundary: i64,
    ) -> Result<()> {
        let close = quote.close;
        let prev_close = self.prev_close.unwrap_or(close);

        let fast = self.ema_fast.update(alpha_for_period(params.ema_fast), close);
        let slow = self.ema_slow.update(alpha_for_period(params.ema_slow), close);
        self.macd = fast - slow;
        self.macd_signal = self
            .macd_signal_ema
            .update(alpha_for_period(params.macd_signal), self.macd);
        self.macd_histogram = self.macd - self.macd_signal;

        let change = close - prev_close;
        let alpha_rsi = alpha_for_period(params.rsi);
        let gain = self.gain_ema.update(alpha_rsi, change.max(0.0));
        let loss = self.loss_ema.update(alpha_rsi, (-change).max(0.0));
        self.rsi = if loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        };

        self.bands.update(alpha_for_period(params.bands), close);
        let sigma = self.bands.std_dev();
        self.band_middle = self.bands.mean;
        self.band_upper = self.band_middle + params.band_sigma * sigma;
        self.band_lower = self.band_middle - params.band_sigma * sigma;
        self.band_width_pct = if self.band_middle != 0.0 {
            (self.band_upper - self.band_lower) / self.band_middle * 100.0
        } else {
            0.0
        };

        let true_range = (quote.high - quote.low)
            .max((quote.high - prev_close).abs())
            .max((quote.low - prev_close).abs());
        self.atr = self.atr_ema.update(alpha_for_period(params.atr), true_range);

        self.volume_ema
            .update(alpha_for_period(params.volume), quote.volume);

        self.extrema.push(quote.high, quote.low)?;
        self.rolling_high = self.extrema.highest().unwrap_or(quote.high);
        self.rolling_low = self.extrema.lowest().unwrap_or(quote.low);

        self.open = quote.open;
        self.high = quote.high;
        self.low = quote.low;
        self.close = close;
        self.volume = quote.volume;
        self.prev_close = Some(close);
        if reference.is_some() {
            self.reference = reference;
        }

        self.cycle_index += 1;
        self.last_time_mark = boundary;
        debug!(cycle = self.cycle_index, boundary, close, "cycle applied");
        Ok(())
    }

    /// Serialize into a snapshot record, stamped with the boundary reached
    /// by the close it describes so that replayed snapshots sort after the
    /// inputs of the cycle they summarize.
    pub fn to_snapshot_record(&self, instrument: &InstrumentId, period_seconds: u32) -> Record {
        let mut record = Record::new(RecordIdentity {
            source_kind: SourceKind::Snapshot,
            instrument: instrument.clone(),
            period_seconds,
            namespace: Namespace::Private,
            time_mark: self.last_time_mark,
        })
        .with_field("cycle_index", FieldValue::Int(self.cycle_index as i64))
        .with_field("open", FieldValue::Float(self.open))
        .with_field("high", FieldValue::Float(self.high))
        .with_field("low", FieldValue::Float(self.low))
        .with_field("close", FieldValue::Float(self.close))
        .with_field("volume", FieldValue::Float(self.volume))
        .with_field(
            "prev_close",
            FieldValue::Float(self.prev_close.unwrap_or(self.close)),
        )
        .with_field("ema_fast", FieldValue::Float(self.ema_fast.value))
        .with_field("ema_slow", FieldValue::Float(self.ema_slow.value))
        .with_field("macd", FieldValue::Float(self.macd))
        .with_field("macd_signal", FieldValue::Float(self.macd_signal))
        .with_field("macd_histogram", FieldValue::Float(self.macd_histogram))
        .with_field("gain_ema", FieldValue::Float(self.gain_ema.value))
        .with_field("loss_ema", FieldValue::Float(self.loss_ema.value))
        .with_field("rsi", FieldValue::Float(self.rsi))
        .with_field("band_mean", FieldValue::Float(self.bands.mean))
        .with_field("band_var", FieldValue::Float(self.bands.var))
        .with_field("band_upper", FieldValue::Float(self.band_upper))
        .with_field("band_middle", FieldValue::Float(self.band_middle))
        .with_field("band_lower", FieldValue::Float(self.band_lower))
        .with_field("band_width_pct", FieldValue::Float(self.band_width_pct))
        .with_field("atr", FieldValue::Float(self.atr))
        .with_field("volume_ema", FieldValue::Float(self.volume_ema.value))
        .with_field("rolling_high", FieldValue::Float(self.rolling_high))
        .with_field("rolling_low", FieldValue::Float(self.rolling_low))
        .with_field("ring_highs", FieldValue::FloatList(self.extrema.highs()))
        .with_field("ring_lows", FieldValue::FloatList(self.extrema.lows()));
        if let Some(reference) = self.reference {
            record = record.with_field("reference", FieldValue::Float(reference));
        }
        record
    }

    /// Decode a snapshot record into this live state. Used by the rebuilding
    /// phase while warm-up is still in progress.
    pub fn ingest(&mut self, record: &Record, params: &IndicatorPeriods) -> Result<()> {
        let decoded = Self::load_raw(record, params)?;
        *self = decoded;
        // Persisted contents must still fit the live configuration.
        self.extrema.reassert_capacity(params.extrema_capacity)?;
        Ok(())
    }

    /// Decode a snapshot record into a fresh, detached state. Reconciliation
    /// uses this so the comparison target never flows through live state.
    pub fn load_raw(record: &Record, params: &IndicatorPeriods) -> Result<Self> {
        let ring = ExtremaRing::from_contents(
            params.extrema_capacity,
            record.require_float_list("ring_highs")?,
            record.require_float_list("ring_lows")?,
        )?;
        let close = record.require_float("close")?;
        Ok(Self {
            cycle_index: record.require_int("cycle_index")? as u64,
            last_time_mark: record.identity.time_mark,
            initialized: true,
            open: record.require_float("open")?,
            high: record.require_float("high")?,
            low: record.require_float("low")?,
            close,
            volume: record.require_float("volume")?,
            prev_close: Some(record.require_float("prev_close")?),
            ema_fast: Ema::seeded_at(record.require_float("ema_fast")?),
            ema_slow: Ema::seeded_at(record.require_float("ema_slow")?),
            macd_signal_ema: Ema::seeded_at(record.require_float("macd_signal")?),
            macd: record.require_float("macd")?,
            macd_signal: record.require_float("macd_signal")?,
            macd_histogram: record.require_float("macd_histogram")?,
            gain_ema: Ema::seeded_at(record.require_float("gain_ema")?),
            loss_ema: Ema::seeded_at(record.require_float("loss_ema")?),
            rsi: record.require_float("rsi")?,
            bands: DecayedVariance {
                mean: record.require_float("band_mean")?,
                var: record.require_float("band_var")?,
                seeded: true,
            },
            band_upper: record.require_float("band_upper")?,
            band_middle: record.require_float("band_middle")?,
            band_lower: record.require_float("band_lower")?,
            band_width_pct: record.require_float("band_width_pct")?,
            atr_ema: Ema::seeded_at(record.require_float("atr")?),
            atr: record.require_float("atr")?,
            volume_ema: Ema::seeded_at(record.require_float("volume_ema")?),
            extrema: ring,
            rolling_high: record.require_float("rolling_high")?,
            rolling_low: record.require_float("rolling_low")?,
            reference: record.field("reference").and_then(FieldValue::as_float),
        })
    }

    /// Field-by-field comparison against an independently decoded persisted
    /// state. The first mismatch is a fatal `ReplayInconsistency`.
    pub fn compare(&self, persisted: &Self, tolerances: &ToleranceConfig) -> Result<()> {
        self.compare_exact("cycle_index", self.cycle_index, persisted.cycle_index)?;
        self.compare_exact(
            "last_time_mark",
            self.last_time_mark,
            persisted.last_time_mark,
        )?;

        for (name, live, stored) in [
            ("ema_fast", self.ema_fast.value, persisted.ema_fast.value),
            ("ema_slow", self.ema_slow.value, persisted.ema_slow.value),
            ("macd", self.macd, persisted.macd),
            ("macd_signal", self.macd_signal, persisted.macd_signal),
            ("macd_histogram", self.macd_histogram, persisted.macd_histogram),
            ("gain_ema", self.gain_ema.value, persisted.gain_ema.value),
            ("loss_ema", self.loss_ema.value, persisted.loss_ema.value),
            ("rsi", self.rsi, persisted.rsi),
            ("band_mean", self.bands.mean, persisted.bands.mean),
            ("band_var", self.bands.var, persisted.bands.var),
            ("band_upper", self.band_upper, persisted.band_upper),
            ("band_middle", self.band_middle, persisted.band_middle),
            ("band_lower", self.band_lower, persisted.band_lower),
            ("band_width_pct", self.band_width_pct, persisted.band_width_pct),
            ("atr", self.atr, persisted.atr),
            ("volume_ema", self.volume_ema.value, persisted.volume_ema.value),
        ] {
            self.compare_float(name, FieldClass::Indicator, live, stored, tolerances)?;
        }

        for (name, live, stored) in [
            ("open", self.open, persisted.open),
            ("high", self.high, persisted.high),
            ("low", self.low, persisted.low),
            ("close", self.close, persisted.close),
            ("volume", self.volume, persisted.volume),
            (
                "prev_close",
                self.prev_close.unwrap_or(self.close),
                persisted.prev_close.unwrap_or(persisted.close),
            ),
            ("rolling_high", self.rolling_high, persisted.rolling_high),
            ("rolling_low", self.rolling_low, persisted.rolling_low),
        ] {
            self.compare_float(name, FieldClass::Price, live, stored, tolerances)?;
        }

        match (self.reference, persisted.reference) {
            (None, None) => {}
            (Some(live), Some(stored)) => {
                self.compare_float("reference", FieldClass::Indicator, live, stored, tolerances)?
            }
            (live, stored) => {
                return Err(self.mismatch(
                    "reference",
                    format!("{live:?}"),
                    format!("{stored:?}"),
                    0.0,
                    0.0,
                ))
            }
        }

        Ok(())
    }

    fn compare_exact<T: PartialEq + std::fmt::Display>(
        &self,
        field: &str,
        live: T,
        persisted: T,
    ) -> Result<()> {
        if live != persisted {
            return Err(self.mismatch(field, live.to_string(), persisted.to_string(), 0.0, 0.0));
        }
        Ok(())
    }

    fn compare_float(
        &self,
        field: &str,
        class: FieldClass,
        live: f64,
        persisted: f64,
        tolerances: &ToleranceConfig,
    ) -> Result<()> {
        let (abs_tol, rel_tol) = match class {
            FieldClass::Exact => (0.0, 0.0),
            FieldClass::Indicator => (tolerances.indicator_abs, tolerances.indicator_rel),
            FieldClass::Price => (tolerances.price_abs, tolerances.price_rel),
        };
        let diff = (live - persisted).abs();
        let within = diff <= abs_tol || diff <= rel_tol * live.abs().max(persisted.abs());
        if !within {
            return Err(self.mismatch(
                field,
                live.to_string(),
                persisted.to_string(),
                abs_tol,
                rel_tol,
            ));
        }
        Ok(())
    }

    fn mismatch(
        &self,
        field: &str,
        live: String,
        persisted: String,
        abs_tol: f64,
        rel_tol: f64,
    ) -> EngineError {
        EngineError::ReplayInconsistency {
            cycle: self.cycle_index,
            field: field.to_string(),
            live,
            persisted,
            abs_tol,
            rel_tol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> IndicatorPeriods {
        IndicatorPeriods::default()
    }

    fn bar(close: f64) -> QuoteView {
        QuoteView {
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 1000.0,
        }
    }

    fn instrument() -> InstrumentId {
        InstrumentId::new("DCE", "i<00>")
    }

    #[test]
    fn test_seed_does_not_count_a_cycle() {
        let p = params();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        assert_eq!(state.cycle_index, 0);
        assert!(state.initialized);
        assert_eq!(state.ema_fast.value, 100.0);
        assert_eq!(state.prev_close, Some(100.0));
    }

    #[test]
    fn test_second_close_ema_worked_example() {
        // Fast EMA period 10 gives α = 2/11; seeded at 100, next close 110.
        let mut p = params();
        p.ema_fast = 10;
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        state.update(&bar(110.0), None, &p, 1800).unwrap();
        assert!((state.ema_fast.value - 101.8181818181).abs() < 1e-6);
        assert_eq!(state.cycle_index, 1);
        assert_eq!(state.last_time_mark, 1800);
    }

    #[test]
    fn test_rsi_all_gains_is_hundred() {
        let p = params();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        for (i, close) in [101.0, 102.0, 103.0].iter().enumerate() {
            state
                .update(&bar(*close), None, &p, 1800 + 900 * i as i64)
                .unwrap();
        }
        assert_eq!(state.rsi, 100.0);
    }

    #[test]
    fn test_bands_straddle_middle() {
        let p = params();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        for (i, close) in [102.0, 98.0, 104.0, 96.0].iter().enumerate() {
            state
                .update(&bar(*close), None, &p, 1800 + 900 * i as i64)
                .unwrap();
        }
        assert!(state.band_upper > state.band_middle);
        assert!(state.band_lower < state.band_middle);
        assert!(state.band_width_pct > 0.0);
    }

    #[test]
    fn test_reference_pass_through_keeps_last_value() {
        let p = params();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        state.update(&bar(101.0), Some(0.4), &p, 1800).unwrap();
        // No fresh reference this cycle; the last one sticks.
        state.update(&bar(102.0), None, &p, 2700).unwrap();
        assert_eq!(state.reference, Some(0.4));
    }

    #[test]
    fn test_snapshot_ingest_round_trip() {
        let p = params();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        state.update(&bar(103.0), Some(0.6), &p, 1800).unwrap();
        state.update(&bar(101.5), None, &p, 2700).unwrap();

        let snapshot = state.to_snapshot_record(&instrument(), 900);
        assert_eq!(snapshot.identity.time_mark, 2700);

        let mut restored = InstanceState::new(&p);
        restored.ingest(&snapshot, &p).unwrap();
        assert_eq!(restored.cycle_index, 2);
        assert_eq!(restored.extrema.len(), state.extrema.len());
        restored.compare(&state, &ToleranceConfig::default()).unwrap();
    }

    #[test]
    fn test_load_raw_leaves_live_state_untouched() {
        let p = params();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        state.update(&bar(105.0), None, &p, 1800).unwrap();

        let snapshot = state.to_snapshot_record(&instrument(), 900);
        let before = state.clone();
        let detached = InstanceState::load_raw(&snapshot, &p).unwrap();
        assert_eq!(state, before);
        assert_eq!(detached.cycle_index, state.cycle_index);
    }

    #[test]
    fn test_compare_flags_indicator_drift() {
        let p = params();
        let tolerances = ToleranceConfig::default();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        state.update(&bar(104.0), None, &p, 1800).unwrap();

        let mut drifted = state.clone();
        drifted.ema_fast.value += 0.01;
        let err = state.compare(&drifted, &tolerances).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("ema_fast"));
    }

    #[test]
    fn test_compare_tolerates_price_noise_within_bounds() {
        let p = params();
        let tolerances = ToleranceConfig::default();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        state.update(&bar(104.0), None, &p, 1800).unwrap();

        let mut nudged = state.clone();
        nudged.close += 5e-4;
        state.compare(&nudged, &tolerances).unwrap();
    }

    #[test]
    fn test_compare_exact_on_cycle_counter() {
        let p = params();
        let tolerances = ToleranceConfig::default();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        state.update(&bar(104.0), None, &p, 1800).unwrap();

        let mut skewed = state.clone();
        skewed.cycle_index += 1;
        let err = state.compare(&skewed, &tolerances).unwrap_err();
        assert!(err.to_string().contains("cycle_index"));
    }

    #[test]
    fn test_serialized_size_constant_over_run_length() {
        let p = params();
        let mut state = InstanceState::new(&p);
        state.seed(&bar(100.0), &p, 900).unwrap();
        for i in 0..100 {
            state
                .update(&bar(100.0 + (i % 7) as f64), None, &p, 1800 + 900 * i)
                .unwrap();
        }
        let small = serde_json::to_string(&state).unwrap().len();
        for i in 100..100_000 {
            state
                .update(&bar(100.0 + (i % 7) as f64), None, &p, 1800 + 900 * i)
                .unwrap();
        }
        let large = serde_json::to_string(&state).unwrap().len();
        let diff = large.abs_diff(small);
        assert!(diff < 64, "serialized size drifted by {diff} bytes");
    }
}
