//! Source decoders: bind-then-decode with strict identity validation
//!
//! A decoder holds an ephemeral binding (instrument + period) that callers
//! refresh from each incoming record's own identity fields immediately before
//! decoding. Upstream producers interleave continuous (`i<00>`) and dated
//! (`i2405`) identity formats for the same routed instrument, so a binding
//! fixed at construction time would wrongly reject one of the two. Any
//! mismatch between binding and record is `BindingMismatch`, never a
//! zero-filled view.

use std::marker::PhantomData;

use crate::core::record::{InstrumentId, Namespace, Record, SourceKind};
use crate::error::{EngineError, Result};

/// Ephemeral decode-time identity, copied from the incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBinding {
    pub instrument: InstrumentId,
    pub period_seconds: u32,
}

impl std::fmt::Display for SourceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}s", self.instrument, self.period_seconds)
    }
}

/// A typed view extractable from a record of one fixed source kind.
pub trait DecodeView: Sized {
    const KIND: SourceKind;
    const NAMESPACE: Namespace;

    /// Extract the view's fields. Missing or mistyped required fields fail
    /// with `MissingDependencyField`.
    fn extract(record: &Record) -> Result<Self>;
}

/// OHLCV market data view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuoteView {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl DecodeView for QuoteView {
    const KIND: SourceKind = SourceKind::Quote;
    const NAMESPACE: Namespace = Namespace::Global;

    fn extract(record: &Record) -> Result<Self> {
        Ok(Self {
            open: record.require_float("open")?,
            high: record.require_float("high")?,
            low: record.require_float("low")?,
            close: record.require_float("close")?,
            volume: record.require_float("volume")?,
        })
    }
}

/// Auxiliary upstream indicator value, passed through into outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceView {
    pub value: f64,
}

impl DecodeView for ReferenceView {
    const KIND: SourceKind = SourceKind::Reference;
    const NAMESPACE: Namespace = Namespace::Private;

    fn extract(record: &Record) -> Result<Self> {
        Ok(Self {
            value: record.require_float("value")?,
        })
    }
}

/// Decoder for one view type, re-bound before every decode.
#[derive(Debug)]
pub struct SourceDecoder<V: DecodeView> {
    binding: Option<SourceBinding>,
    _view: PhantomData<V>,
}

impl<V: DecodeView> SourceDecoder<V> {
    pub fn new() -> Self {
        Self {
            binding: None,
            _view: PhantomData,
        }
    }

    /// Set the expected identity for the next decode. Callers copy these
    /// from the incoming record itself, never from construction-time config.
    pub fn bind(&mut self, instrument: InstrumentId, period_seconds: u32) {
        self.binding = Some(SourceBinding {
            instrument,
            period_seconds,
        });
    }

    pub fn binding(&self) -> Option<&SourceBinding> {
        self.binding.as_ref()
    }

    /// Validate the record's declared identity against the current binding,
    /// then extract the typed view.
    pub fn decode(&self, record: &Record) -> Result<V> {
        let binding = self.binding.as_ref().ok_or_else(|| {
            EngineError::BindingMismatch {
                expected: "<unbound>".to_string(),
                found: describe(record),
            }
        })?;

        let id = &record.identity;
        let matches = id.source_kind == V::KIND
            && id.namespace == V::NAMESPACE
            && id.instrument == binding.instrument
            && id.period_seconds == binding.period_seconds;
        if !matches {
            return Err(EngineError::BindingMismatch {
                expected: format!("{} {} in {}", V::KIND, binding, V::NAMESPACE),
                found: describe(record),
            });
        }

        V::extract(record)
    }
}

impl<V: DecodeView> Default for SourceDecoder<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(record: &Record) -> String {
    let id = &record.identity;
    format!(
        "{} {}@{}s in {}",
        id.source_kind, id.instrument, id.period_seconds, id.namespace
    )
}
