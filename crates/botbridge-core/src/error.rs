use thiserror::Error;

/// Failures surfaced by the gateway core.
///
/// Display strings are the wire tokens: they travel into client error
/// frames and into cached integration responses, so they stay stable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No live upstream connection to the bot backend.
    #[error("service_unavailable")]
    ServiceUnavailable,

    /// User id does not parse as a non-negative integer.
    #[error("invalid_user_id")]
    InvalidUserId,

    /// A synchronous reply wait outlived its deadline.
    #[error("timeout")]
    Timeout,

    /// Inbound frame or bot callback carries no routable user id.
    #[error("missing_user_id")]
    MissingUserId,

    /// A reply wait was registered with an empty request id.
    #[error("missing_request_id")]
    MissingRequestId,

    /// Unparsable or structurally invalid input. Dropped at the parse
    /// boundary, never surfaced as a protocol ack.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The persisted session snapshot failed to parse. Quarantined,
    /// never fatal to startup.
    #[error("persisted snapshot corrupt: {0}")]
    PersistenceCorrupt(String),

    /// Transport write failure on an established connection.
    #[error("send failed: {0}")]
    Send(String),
}
