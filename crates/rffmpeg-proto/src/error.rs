use thiserror::Error;

/// Errors raised while parsing state lines or handling argument payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("empty state line")]
    EmptyStateLine,

    #[error("malformed state line: {0:?}")]
    MalformedStateLine(String),

    #[error("argument {index} is not valid UTF-8")]
    NonUtf8Argument { index: usize },

    #[error("argument payload is not valid base64: {0}")]
    InvalidPayload(String),

    #[error("argument payload does not decode to UTF-8 text")]
    NonUtf8Payload,
}
