//! Online indicator accumulators
//!
//! Every accumulator here is an O(1)-memory recurrence: no history vectors,
//! no wall-clock reads, no randomness. Outputs are pure functions of the
//! current accumulator values and the current input, which is what makes
//! checkpoint replay bit-reproducible.
//!
//! Smoothing factors are not stored in the accumulators; they are derived
//! from configured periods and passed in on each update, so persisted state
//! is pure data and constants always come from the live configuration.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// EMA smoothing factor for an N-period equivalent: `α = 2/(N+1)`.
pub fn alpha_for_period(period: u32) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// Exponential moving average, seeded at the first observed value rather
/// than zero to avoid warm-up bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ema {
    pub value: f64,
    pub seeded: bool,
}

impl Ema {
    pub fn new() -> Self {
        Self {
            value: 0.0,
            seeded: false,
        }
    }

    /// An EMA pre-seeded at a fixed value (RSI gain/loss EMAs start at zero).
    pub fn seeded_at(value: f64) -> Self {
        Self {
            value,
            seeded: true,
        }
    }

    /// `ema <- α·x + (1−α)·ema`; the first observation seeds the value.
    pub fn update(&mut self, alpha: f64, x: f64) -> f64 {
        if self.seeded {
            self.value = alpha * x + (1.0 - alpha) * self.value;
        } else {
            self.value = x;
            self.seeded = true;
        }
        self.value
    }
}

impl Default for Ema {
    fn default() -> Self {
        Self::new()
    }
}

/// Welford-with-decay mean/variance:
/// `δ = x − mean; mean += α·δ; var += α·(δ² − var)`.
///
/// This is not windowed variance; it decays smoothly and needs no history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayedVariance {
    pub mean: f64,
    pub var: f64,
    pub seeded: bool,
}

impl DecayedVariance {
    pub fn new() -> Self {
        Self {
            mean: 0.0,
            var: 0.0,
            seeded: false,
        }
    }

    pub fn update(&mut self, alpha: f64, x: f64) {
        if self.seeded {
            let delta = x - self.mean;
            self.mean += alpha * delta;
            self.var += alpha * (delta * delta - self.var);
        } else {
            self.mean = x;
            self.var = 0.0;
            self.seeded = true;
        }
    }

    /// Standard deviation, clamped non-negative before the square root for
    /// numerical stability.
    pub fn std_dev(&self) -> f64 {
        self.var.max(0.0).sqrt()
    }
}

impl Default for DecayedVariance {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity ring of (high, low) pairs for rolling extrema.
///
/// The capacity is an explicit invariant: exceeding it is `UnboundedGrowth`,
/// and it is re-asserted after every deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtremaRing {
    capacity: usize,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
}

impl ExtremaRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            highs: VecDeque::with_capacity(capacity),
            lows: VecDeque::with_capacity(capacity),
        }
    }

    /// Rebuild from persisted contents, enforcing the configured capacity.
    pub fn from_contents(capacity: usize, highs: Vec<f64>, lows: Vec<f64>) -> Result<Self> {
        let mut ring = Self {
            capacity,
            highs: highs.into(),
            lows: lows.into(),
        };
        ring.reassert_capacity(capacity)?;
        Ok(ring)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.highs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.highs.is_empty()
    }

    /// Push one cycle's high/low, evicting the oldest entry when full.
    pub fn push(&mut self, high: f64, low: f64) -> Result<()> {
        if self.highs.len() >= self.capacity {
            self.highs.pop_front();
            self.lows.pop_front();
        }
        self.highs.push_back(high);
        self.lows.push_back(low);
        self.check_bounds()
    }

    /// Re-assert the capacity invariant, e.g. after deserializing persisted
    /// contents whose size the configuration no longer matches.
    pub fn reassert_capacity(&mut self, capacity: usize) -> Result<()> {
        self.capacity = capacity;
        self.check_bounds()
    }

    fn check_bounds(&self) -> Result<()> {
        if self.highs.len() > self.capacity || self.lows.len() != self.highs.len() {
            return Err(EngineError::UnboundedGrowth {
                what: "extrema ring".to_string(),
                len: self.highs.len().max(self.lows.len()),
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn highest(&self) -> Option<f64> {
        self.highs.iter().copied().fold(None, |acc, v| match acc {
            Some(m) if m >= v => Some(m),
            _ => Some(v),
        })
    }

    pub fn lowest(&self) -> Option<f64> {
        self.lows.iter().copied().fold(None, |acc, v| match acc {
            Some(m) if m <= v => Some(m),
            _ => Some(v),
        })
    }

    pub fn highs(&self) -> Vec<f64> {
        self.highs.iter().copied().collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.lows.iter().copied().collect()
    }
}
