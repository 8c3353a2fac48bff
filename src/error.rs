//! Crate-wide error types.
//!
//! Each module that can fail gets its own `thiserror`-derived enum so call
//! sites can match on error kind instead of string content, the way
//! `receiver::session::SessionError` does in the teacher repo.

use thiserror::Error;

/// Errors raised while loading or validating the global JSON config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Errors raised by the sensor/organization/topic registries.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown sensor uuid")]
    UnknownSensor,
    #[error("unknown organization uuid")]
    UnknownOrganization,
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("registry JSON malformed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Per-decoder-invocation failure classes, matching spec.md §7.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("authorization failed: {0}")]
    AuthzFailed(String),
}

/// Listener-level failures (bind, accept, HTTP framing).
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source {0} is blacklisted")]
    Blacklisted(String),
    #[error("bad request url")]
    BadUrl,
    #[error("decoder error: {0}")]
    Decode(#[from] DecodeError),
    #[error("connection exceeded its memory limit")]
    ConnectionMemoryLimitExceeded,
}

/// Publish-side failure classes the broker client can report back.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorClass {
    #[error("queue full")]
    QueueFull,
    #[error("message too large")]
    MessageTooLarge,
    #[error("unknown partition")]
    UnknownPartition,
    #[error("unknown topic")]
    UnknownTopic,
}
