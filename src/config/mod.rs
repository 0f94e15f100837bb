//! Configuration module for engine settings and YAML loading
//!
//! This module provides:
//! - Configuration types (`EngineConfig`, `InstrumentConfig`, `IndicatorPeriods`)
//! - YAML loading functionality (`load_config`)
//! - Logging initialization

pub mod logging;
mod loader;
mod types;

// Re-export types
pub use types::{
    CheckpointConfig, EngineConfig, IndicatorPeriods, InstrumentConfig, ToleranceConfig,
};

// Re-export loader functions
pub use loader::{load_config, load_config_from_str};
