//! Error types for the live telemetry crate.

/// Errors that can occur at the edges of the live pipeline.
///
/// The core (store, aggregators, broadcaster) never fails on input; these
/// errors come from configuration, transport decoding and request limits.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// The layered configuration could not be extracted.
    #[error("configuration error: {0}")]
    Config(String),

    /// An export request carried more records than `ingest.max_records_per_request`.
    #[error("request too large: {records} records exceeds limit of {limit}")]
    RequestTooLarge {
        records: usize,
        limit: usize,
    },

    /// A trace, span or session identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A query parameter had an unrecognised value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// OTLP/HTTP body that is neither protobuf nor JSON.
    #[error("unsupported content type: {content_type}")]
    InvalidContentType { content_type: String },

    #[error("malformed protobuf body: {source}")]
    ProtoDecode { source: prost::DecodeError },

    #[error("malformed JSON body: {source}")]
    JsonDecode { source: serde_json::Error },

    #[error("failed to encode JSON reply: {source}")]
    JsonEncode { source: serde_json::Error },
}

impl From<LiveError> for tonic::Status {
    fn from(err: LiveError) -> Self {
        match err {
            LiveError::RequestTooLarge { records, limit } => Self::resource_exhausted(format!(
                "request too large: {records} records exceeds limit of {limit}"
            )),
            LiveError::InvalidId(msg) | LiveError::InvalidParameter(msg) => {
                Self::invalid_argument(msg)
            }
            _ => Self::internal(err.to_string()),
        }
    }
}
