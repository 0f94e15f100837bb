//! Record: the immutable, self-describing input/output unit
//!
//! A record carries its full identity (source kind, instrument, period,
//! namespace, time mark) plus an ordered payload of named field values.
//! Records are created by the ingestion boundary, consumed immediately and
//! never mutated; the engine's own outputs are records too.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Which logical stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Market data (OHLCV) from the shared namespace
    Quote,
    /// Auxiliary upstream indicator value from the private namespace
    Reference,
    /// The engine's own persisted state, emitted per closed cycle and
    /// replayed back during resume
    Snapshot,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Quote => write!(f, "quote"),
            SourceKind::Reference => write!(f, "reference"),
            SourceKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Namespace a record was published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Shared market data visible to every consumer
    Global,
    /// Data produced and owned by this computation
    Private,
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::Global => write!(f, "global"),
            Namespace::Private => write!(f, "private"),
        }
    }
}

/// Instrument identity: market plus code.
///
/// Codes come in two formats: the continuous (logical) form `i<00>` and the
/// concrete dated form `i2405`. Both refer to the same routed instrument, so
/// routing uses [`InstrumentId::root`] while decoders re-bind to the exact
/// per-record form before every decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentId {
    pub market: String,
    pub code: String,
}

/// Suffix marking a continuous (logical) contract code.
pub const CONTINUOUS_SUFFIX: &str = "<00>";

impl InstrumentId {
    pub fn new(market: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            market: market.into(),
            code: code.into(),
        }
    }

    /// True for continuous (logical) codes like `i<00>`.
    pub fn is_continuous(&self) -> bool {
        self.code.ends_with(CONTINUOUS_SUFFIX)
    }

    /// Commodity root shared by continuous and dated codes:
    /// `i<00>` -> `i`, `i2405` -> `i`, `cu` -> `cu`.
    pub fn root(&self) -> &str {
        if let Some(stripped) = self.code.strip_suffix(CONTINUOUS_SUFFIX) {
            return stripped;
        }
        let end = self
            .code
            .rfind(|c: char| !c.is_ascii_digit())
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.code[..end]
    }

    /// Key used by the router: one pipeline per (market, commodity root).
    pub fn routing_key(&self) -> (String, String) {
        (self.market.clone(), self.root().to_string())
    }
}

impl std::fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.market, self.code)
    }
}

/// One payload value. Vectors stay bounded: they only ever hold ring-buffer
/// contents whose capacity is fixed by configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Text(String),
    FloatList(Vec<f64>),
    IntList(Vec<i64>),
}

impl FieldValue {
    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float_list(&self) -> Option<&[f64]> {
        match self {
            FieldValue::FloatList(v) => Some(v),
            _ => None,
        }
    }
}

/// Full record identity tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub source_kind: SourceKind,
    pub instrument: InstrumentId,
    pub period_seconds: u32,
    pub namespace: Namespace,
    pub time_mark: i64,
}

/// Immutable identified data unit with an ordered field payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identity: RecordIdentity,
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new(identity: RecordIdentity) -> Self {
        Self {
            identity,
            fields: Vec::new(),
        }
    }

    /// Append a field, preserving payload order.
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Required float field; absence or wrong type is a hard error, never a
    /// substituted default.
    pub fn require_float(&self, name: &str) -> Result<f64> {
        self.field(name)
            .and_then(FieldValue::as_float)
            .ok_or_else(|| EngineError::MissingDependencyField {
                field: name.to_string(),
                source_kind: self.identity.source_kind.to_string(),
            })
    }

    /// Required integer field, same no-fallback policy as [`require_float`].
    ///
    /// [`require_float`]: Record::require_float
    pub fn require_int(&self, name: &str) -> Result<i64> {
        self.field(name)
            .and_then(FieldValue::as_int)
            .ok_or_else(|| EngineError::MissingDependencyField {
                field: name.to_string(),
                source_kind: self.identity.source_kind.to_string(),
            })
    }

    /// Required float-list field (ring buffer contents inside snapshots).
    pub fn require_float_list(&self, name: &str) -> Result<Vec<f64>> {
        self.field(name)
            .and_then(FieldValue::as_float_list)
            .map(|s| s.to_vec())
            .ok_or_else(|| EngineError::MissingDependencyField {
                field: name.to_string(),
                source_kind: self.identity.source_kind.to_string(),
            })
    }
}
