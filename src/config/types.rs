//! Configuration types for the computation engine
//!
//! This module defines all configuration structs that are loaded from YAML.
//! Per-instrument identity, readiness requirements and indicator periods are
//! explicit here; nothing is pulled from global mutable state.

use serde::{Deserialize, Serialize};

use crate::core::record::{InstrumentId, SourceKind};
use crate::error::EngineError;

/// Indicator periods, translated to smoothing factors at update time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorPeriods {
    pub ema_fast: u32,
    pub ema_slow: u32,
    pub macd_signal: u32,
    pub rsi: u32,
    pub bands: u32,
    /// Band half-width in standard deviations
    pub band_sigma: f64,
    pub atr: u32,
    pub volume: u32,
    /// Fixed size of the rolling extrema window
    pub extrema_capacity: usize,
}

impl Default for IndicatorPeriods {
    fn default() -> Self {
        Self {
            ema_fast: 12,
            ema_slow: 26,
            macd_signal: 9,
            rsi: 14,
            bands: 20,
            band_sigma: 2.0,
            atr: 14,
            volume: 20,
            extrema_capacity: 20,
        }
    }
}

/// One registered instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Exchange/market identifier (e.g., "DCE")
    pub market: String,
    /// Contract code, continuous (`i<00>`) or dated (`i2405`)
    pub code: String,
    /// Cycle length in seconds
    pub period_seconds: u32,
    /// Source kinds that must all report before a cycle closes
    pub required_sources: Vec<SourceKind>,
    #[serde(default)]
    pub periods: IndicatorPeriods,
}

impl InstrumentConfig {
    pub fn instrument_id(&self) -> InstrumentId {
        InstrumentId::new(&self.market, &self.code)
    }

    /// Validate per-instrument configuration rules
    pub fn validate(&self) -> Result<(), EngineError> {
        let label = format!("{}:{}", self.market, self.code);

        if self.market.trim().is_empty() || self.code.trim().is_empty() {
            return Err(EngineError::Config(
                "instrument market and code cannot be empty".to_string(),
            ));
        }

        if self.period_seconds == 0 {
            return Err(EngineError::Config(format!(
                "Instrument '{}': period_seconds must be > 0",
                label
            )));
        }

        // Rule: readiness gating without a quote source can never produce
        // a state update, so quote is mandatory.
        if !self.required_sources.contains(&SourceKind::Quote) {
            return Err(EngineError::Config(format!(
                "Instrument '{}': required_sources must include quote",
                label
            )));
        }

        for (i, kind) in self.required_sources.iter().enumerate() {
            if self.required_sources[..i].contains(kind) {
                return Err(EngineError::Config(format!(
                    "Instrument '{}': duplicate required source '{}'",
                    label, kind
                )));
            }
        }

        if self.required_sources.contains(&SourceKind::Snapshot) {
            return Err(EngineError::Config(format!(
                "Instrument '{}': snapshot records cannot gate cycle close",
                label
            )));
        }

        let p = &self.periods;
        for (name, value) in [
            ("ema_fast", p.ema_fast),
            ("ema_slow", p.ema_slow),
            ("macd_signal", p.macd_signal),
            ("rsi", p.rsi),
            ("bands", p.bands),
            ("atr", p.atr),
            ("volume", p.volume),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!(
                    "Instrument '{}': period '{}' must be >= 1",
                    label, name
                )));
            }
        }

        if p.ema_fast >= p.ema_slow {
            return Err(EngineError::Config(format!(
                "Instrument '{}': ema_fast ({}) must be < ema_slow ({})",
                label, p.ema_fast, p.ema_slow
            )));
        }

        if p.band_sigma <= 0.0 {
            return Err(EngineError::Config(format!(
                "Instrument '{}': band_sigma must be > 0, got {}",
                label, p.band_sigma
            )));
        }

        if p.extrema_capacity == 0 || p.extrema_capacity > 1024 {
            return Err(EngineError::Config(format!(
                "Instrument '{}': extrema_capacity must be 1-1024, got {}",
                label, p.extrema_capacity
            )));
        }

        Ok(())
    }
}

/// Checkpoint storage and resume behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory holding one checkpoint file per instrument
    pub dir: String,
    /// Run-local cycles to process before snapshot verification activates
    pub warmup_cycles: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: "data/checkpoints".to_string(),
            warmup_cycles: 5,
        }
    }
}

/// Float-comparison tolerances for reconciliation.
///
/// Indicator-grade values are smoothed and must agree tightly; price-grade
/// values carry raw market noise and get looser bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToleranceConfig {
    pub indicator_abs: f64,
    pub indicator_rel: f64,
    pub price_abs: f64,
    pub price_rel: f64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            indicator_abs: 1e-6,
            indicator_rel: 1e-5,
            price_abs: 1e-3,
            price_rel: 1e-4,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub instruments: Vec<InstrumentConfig>,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub tolerances: ToleranceConfig,
}

impl EngineConfig {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.instruments.is_empty() {
            return Err(EngineError::Config(
                "at least one instrument must be configured".to_string(),
            ));
        }

        for instrument in &self.instruments {
            instrument.validate()?;
        }

        // Rule: routing is by (market, commodity root), so two instruments
        // sharing that key would contend for one pipeline.
        for (i, a) in self.instruments.iter().enumerate() {
            for b in &self.instruments[i + 1..] {
                if a.instrument_id().routing_key() == b.instrument_id().routing_key() {
                    return Err(EngineError::Config(format!(
                        "Instruments '{}:{}' and '{}:{}' share a routing key",
                        a.market, a.code, b.market, b.code
                    )));
                }
            }
        }

        if self.checkpoint.warmup_cycles == 0 {
            return Err(EngineError::Config(
                "checkpoint.warmup_cycles must be >= 1".to_string(),
            ));
        }

        let t = &self.tolerances;
        for (name, value) in [
            ("indicator_abs", t.indicator_abs),
            ("indicator_rel", t.indicator_rel),
            ("price_abs", t.price_abs),
            ("price_rel", t.price_rel),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return Err(EngineError::Config(format!(
                    "tolerances.{} must be a positive finite number, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}
