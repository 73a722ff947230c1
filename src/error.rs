//! Error taxonomy for the publisher core.
//!
//! No error here is fatal to the dispatcher: endpoint-scoped failures feed the
//! failure-recovery path and the loop keeps running until shutdown.

use thiserror::Error;

/// Failures raised by the transport layer beneath an endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {server}: {message}")]
    Connect { server: String, message: String },

    #[error("Connection closed")]
    Closed,

    #[error("Transport worker is gone")]
    WorkerGone,
}

/// Errors surfaced while publishing payloads and processing responses.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Server did not respond within network timeout")]
    NetworkTimeout,

    #[error("Server did not respond to keepalive")]
    NetworkPing,

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Spool is empty or inconsistent")]
    PayloadInvalid,

    #[error("BUG ASSERTION: {0}")]
    BugAssertion(String),
}
