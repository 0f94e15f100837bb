//! Core module - records, decoding, cycle aggregation, state and routing
//!
//! This module uses **explicit re-exports** instead of glob exports
//! (`pub use module::*`) to provide better API visibility and prevent
//! accidental public API changes.
//!
//! ## Usage
//! Prefer importing from `crate::core`:
//! ```ignore
//! use crate::core::{InstanceRouter, Record, SourceKind};
//! ```

pub mod channels;
pub mod checkpoint;
pub mod cycle;
pub mod decode;
pub mod indicators;
pub mod record;
pub mod router;
pub mod runtime;
pub mod state;

// Explicit re-exports for record module
pub use record::{
    FieldValue, InstrumentId, Namespace, Record, RecordIdentity, SourceKind,
    CONTINUOUS_SUFFIX,
};

// Explicit re-exports for decode module
pub use decode::{DecodeView, QuoteView, ReferenceView, SourceBinding, SourceDecoder};

// Explicit re-exports for cycle module
pub use cycle::{CycleAggregator, CycleDecision, CyclePhase};

// Explicit re-exports for indicators module
pub use indicators::{alpha_for_period, DecayedVariance, Ema, ExtremaRing};

// Explicit re-exports for state module
pub use state::InstanceState;

// Explicit re-exports for checkpoint module
pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, ResumePhase, ResumeVerifier,
};

// Explicit re-exports for router module
pub use router::{InstanceRouter, InstrumentPipeline};

// Explicit re-exports for channels module
pub use channels::{ChannelBundle, DEFAULT_CHANNEL_CAPACITY};

// Explicit re-exports for runtime module
pub use runtime::router_task;
