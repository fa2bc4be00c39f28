use thiserror::Error;

/// Why an inbound frame was rejected. The `Display` text is sent back to the
/// client verbatim, so it names the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message is not valid JSON: {0}")]
    Json(String),

    #[error("message must be a JSON object")]
    NotAnObject,

    #[error("missing message type")]
    MissingType,

    #[error("unrecognized message type: {0}")]
    UnrecognizedType(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: expected {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("{0}")]
    Constraint(&'static str),
}
