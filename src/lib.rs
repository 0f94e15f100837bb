//! Replay-consistent streaming computation core
//!
//! Deterministic per-instrument cycle processing:
//! - Typed source decoding with strict identity binding
//! - Cycle detection with multi-source readiness gating
//! - O(1)-memory online indicator state
//! - Checkpointing with a verified two-phase resume protocol

pub mod config;
pub mod core;
pub mod error;

pub use error::EngineError;
