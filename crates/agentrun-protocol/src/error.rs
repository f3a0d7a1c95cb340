//! Error types for wire-format handling.

use thiserror::Error;

/// Errors raised while interpreting provider output.
///
/// Decoders never surface these for a single bad line; they are used by
/// callers that parse one complete document (e.g. a token endpoint reply).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field was missing from a payload.
    #[error("Missing field '{0}' in payload")]
    MissingField(&'static str),
}
