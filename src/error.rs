/// A payload that could not be turned into events.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("unexpected payload shape: {0}")]
    UnexpectedShape(&'static str),
}

/// Error surfaced by the event source. Decode failures never get here;
/// the adapter logs and skips them.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// A numeric field that could not be parsed and was treated as zero.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not parse {field} value {raw:?} as a number")]
pub struct ParseWarning {
    pub field: &'static str,
    pub raw: String,
}
