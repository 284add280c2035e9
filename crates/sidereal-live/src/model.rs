//! Internal telemetry records.
//!
//! Every OTLP leaf item (span, metric data point, log record) becomes one
//! immutable record. Resource attributes are flattened into each record so
//! queries never have to walk back to the batch it arrived in.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::LiveError;

/// Attribute map with JSON values, ordered by key.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Telemetry signal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl Signal {
    /// Get the signal name used in routes and event names.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Traces => "traces",
            Self::Metrics => "metrics",
            Self::Logs => "logs",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Signal {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "traces" | "spans" => Ok(Self::Traces),
            "metrics" => Ok(Self::Metrics),
            "logs" => Ok(Self::Logs),
            other => Err(LiveError::InvalidParameter(format!("unknown signal: {other}"))),
        }
    }
}

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            /// Build an identifier from raw bytes.
            ///
            /// Returns `None` unless the slice is exactly the right width and
            /// not all zeros (the OTLP encoding of "absent").
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                let raw: [u8; $len] = bytes.try_into().ok()?;
                if raw.iter().all(|b| *b == 0) {
                    return None;
                }
                Some(Self(raw))
            }

            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(raw: [u8; $len]) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = LiveError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)
                    .map_err(|e| LiveError::InvalidId(format!("{s}: {e}")))?;
                Self::from_bytes(&bytes).ok_or_else(|| {
                    LiveError::InvalidId(format!(
                        "{s}: expected {} non-zero bytes",
                        $len
                    ))
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// 16-byte W3C trace identifier.
    TraceId,
    16
);

hex_id!(
    /// 8-byte span identifier.
    SpanId,
    8
);

/// Span kind, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    #[default]
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl From<i32> for SpanKind {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Internal,
            2 => Self::Server,
            3 => Self::Client,
            4 => Self::Producer,
            5 => Self::Consumer,
            _ => Self::Unspecified,
        }
    }
}

/// Span status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl From<i32> for StatusCode {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Ok,
            2 => Self::Error,
            _ => Self::Unset,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: u64,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub attributes: Attributes,
}

/// A single span with its resource context flattened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    pub status: SpanStatus,
    pub service_name: String,
    pub scope_name: Option<String>,
    pub scope_version: Option<String>,
    /// Resource attributes as sent by the producer.
    pub resource: Attributes,
    /// Resource attributes overlaid with the span's own attributes.
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
}

impl SpanRecord {
    /// Span duration, if the span has ended.
    pub fn duration_nanos(&self) -> Option<u64> {
        if self.end_time_unix_nano == 0 {
            return None;
        }
        self.end_time_unix_nano.checked_sub(self.start_time_unix_nano)
    }

    pub fn is_error(&self) -> bool {
        self.status.code == StatusCode::Error
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// String attribute, or `None` if absent, empty or not a string.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Integer attribute; accepts integers, whole floats and numeric strings.
    pub fn attribute_i64(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key)? {
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Floating-point attribute; accepts numbers and numeric strings.
    pub fn attribute_f64(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Sum,
    Histogram,
    ExponentialHistogram,
    Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileValue {
    pub quantile: f64,
    pub value: f64,
}

/// Value of a single metric data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricValue {
    Number {
        value: f64,
    },
    Histogram {
        count: u64,
        sum: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
        explicit_bounds: Vec<f64>,
        bucket_counts: Vec<u64>,
    },
    ExponentialHistogram {
        count: u64,
        sum: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
        scale: i32,
        zero_count: u64,
    },
    Summary {
        count: u64,
        sum: f64,
        quantiles: Vec<QuantileValue>,
    },
}

/// One metric data point with its metric and resource context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: MetricKind,
    /// Set for sums only.
    pub is_monotonic: Option<bool>,
    pub start_time_unix_nano: u64,
    pub time_unix_nano: u64,
    pub value: MetricValue,
    pub exemplar_trace_id: Option<TraceId>,
    pub exemplar_span_id: Option<SpanId>,
    pub service_name: String,
    pub scope_name: Option<String>,
    pub resource: Attributes,
    pub attributes: Attributes,
}

/// One log record with its resource context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: u64,
    pub severity_number: i32,
    pub severity_text: String,
    pub body: serde_json::Value,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
    pub service_name: String,
    pub scope_name: Option<String>,
    pub resource: Attributes,
    pub attributes: Attributes,
}

impl LogRecord {
    /// Event time, falling back to observed time when the producer left it unset.
    pub const fn effective_time(&self) -> u64 {
        if self.time_unix_nano == 0 {
            self.observed_time_unix_nano
        } else {
            self.time_unix_nano
        }
    }
}
