//! Error types for the bridge.

use std::path::PathBuf;

use crate::attach::VmError;

/// Errors produced while encoding or decoding a wire envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Event name must be a non-empty string")]
    EmptyEventName,

    #[error("Failed to serialize payload: {0}")]
    SerializationFailure(#[source] serde_json::Error),

    #[error("Message is not valid text: {0}")]
    NotAString(#[source] std::str::Utf8Error),

    #[error("Message is not valid JSON: {0}")]
    ParseFailure(#[source] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Message must contain both 'event' and 'payload' fields")]
    MissingFields,

    #[error("Message 'event' field is not a string")]
    EventNotString,

    #[error("Message 'payload' field is not an array")]
    PayloadNotArray,
}

/// Errors from the boundary-crossing call path.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Thread attachment refused: limit of {limit} attached threads reached")]
    AttachmentRefused { limit: usize },

    #[error("Thread attachment failed: {0}")]
    AttachmentFailed(#[source] VmError),

    #[error("Host entry point is not installed")]
    Disconnected,

    #[error("Embedded runtime is not running")]
    RuntimeNotRunning,

    #[error("Embedded runtime is already running")]
    AlreadyRunning,

    #[error("Cannot send '{0}' before the embedded runtime is ready for app events")]
    NotReady(&'static str),

    #[error("Host may not send system message: {0}")]
    InvalidSystemMessage(String),

    #[error("Runtime thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn runtime thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Errors from lifecycle (pause/resume) coordination.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Cannot dispatch '{0}' before the embedded runtime is ready for app events")]
    PrematureDispatch(&'static str),

    #[error("Pause event {0} was abandoned before it was released")]
    Abandoned(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Errors raised by [`crate::EventChannel::post`] and friends.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Errors from loading bridge configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
