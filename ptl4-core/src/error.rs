//! Error types.

/// Errors surfaced by the public API and internal fallible paths.
///
/// Delivery status of an individual operation is not an error: it travels as
/// [`NiFail`](ptl4_wire::NiFail) inside events and response headers.
#[derive(Debug, thiserror::Error)]
pub enum PtlError {
    /// An argument is outside the limits of the interface.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    /// A table, queue or buffer has no free space.
    #[error("no space: {0}")]
    NoSpace(&'static str),
    /// A received message could not be decoded.
    #[error("malformed message")]
    Wire(#[from] ptl4_wire::WireError),
    /// The transport failed to move data or send a message.
    #[error("transport failure")]
    Transport(#[source] std::io::Error),
    /// The engine reached a state it could not continue from; the operation
    /// was failed and cleaned up.
    #[error("request processing failed")]
    Fail,
}
