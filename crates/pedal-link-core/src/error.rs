use crate::transport::TransportKind;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Device selection cancelled, permission denied, port busy.
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("a connection is already open or opening")]
    AlreadyConnected,
    /// `disconnect` was called before the transport finished opening.
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("no {0} transport is configured")]
    Unavailable(TransportKind),
    #[error("write failed: {0}")]
    Write(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Operator input rejected before anything reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidInputError {
    #[error("{field}: `{input}` is not an integer")]
    NotAnInteger { field: &'static str, input: String },
    #[error("{field}: {value} is outside 0..={max}")]
    OutOfRange { field: &'static str, value: i64, max: u32 },
}
