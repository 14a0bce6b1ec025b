//! Shared error types.
//!
//! These are the domain-level errors; the HTTP layer maps them onto status
//! codes, and the binary maps them onto a non-zero exit.

use thiserror::Error;

/// Errors raised while resolving configuration at startup. All of these are
/// fatal: the bridge refuses to start with a half-resolved tool command.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to read tool config {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse tool config {path}: {source}")]
    ParseFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no stdio server entry in tool config {path}")]
    NoStdioServer { path: String },

    #[error("server entry {name:?} has no command")]
    MissingCommand { name: String },

    #[error("unresolved input \"${{input:{id}}}\" in server args")]
    UnresolvedInput { id: String },
}

/// Errors raised by JSON-RPC envelope validation.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("body must be a JSON object or array")]
    NotObjectOrArray,

    #[error("batch must not be empty")]
    EmptyBatch,

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("jsonrpc version must be the string \"2.0\"")]
    BadVersion,

    #[error("method must be a string")]
    BadMethod,

    #[error("message has no method and no id")]
    MissingId,

    #[error("response must carry exactly one of result or error")]
    ResultAndError,

    #[error("message has no method and no result or error")]
    NotAnyShape,

    #[error("batch element {index}: {source}")]
    BatchElement {
        index: usize,
        #[source]
        source: Box<EnvelopeError>,
    },
}

/// Errors raised by the child-process supervisor.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("child process is not running")]
    NotRunning,

    #[error("failed to spawn child process: {0}")]
    SpawnFailed(String),

    #[error("child stdin write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}
