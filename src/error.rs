//! Error types for the runtime adapter, registry backends and bridge.

use thiserror::Error;

use crate::types::ServiceId;

/// Failures talking to the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Event channel closed")]
    ChannelClosed,
}

/// Failures talking to a registry backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid registry URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Unrecognized registry backend: {0}")]
    UnsupportedScheme(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-operation failures surfaced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Failed to register {id}: {source}")]
    Register {
        id: ServiceId,
        #[source]
        source: BackendError,
    },

    #[error("Failed to deregister {id}: {source}")]
    Deregister {
        id: ServiceId,
        #[source]
        source: BackendError,
    },

    #[error("Failed to list registered services: {0}")]
    List(#[source] BackendError),
}
