/// Transport error taxonomy.
///
/// Only exhaustion of the full retry budget on a *direct* call surfaces an
/// error to its caller. Queued operations that exhaust their budget are
/// dropped with a final ledger entry instead — the original caller has long
/// since returned. Malformed payloads are logged and dropped at the router
/// boundary, never propagated to message handlers.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Direct-path retry budget exhausted. Carries the full failure history,
    /// one message per failed attempt.
    #[error("operation '{operation}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
        history: Vec<String>,
    },

    /// The channel's adapter is absent on this device. Routed immediately to
    /// the alternate channel or queue, never retried against this channel.
    #[error("{channel} adapter unavailable on this device")]
    AdapterUnavailable { channel: &'static str },

    /// A payload that could not be decoded into a known message shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A single send attempt failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization of an outgoing payload failed.
    #[error("encode failed: {0}")]
    EncodeFailed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
