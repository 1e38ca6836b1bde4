//! Error types for session, configuration and provisioning operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while configuring, provisioning or driving a session.
#[derive(Debug, Error)]
pub enum VicunaError {
    /// Model identifier is not one of the supported models.
    #[error(
        "Model '{model}' is not supported. Supported models: {supported}. \
         Set allow_unsupported_model to run it anyway"
    )]
    UnsupportedModel { model: String, supported: String },

    /// No download source exists for this asset on the current platform.
    #[error("No {asset} download is available for platform '{platform}'. Set the path explicitly")]
    PlatformUnsupported { platform: String, asset: String },

    /// No download source is registered for the asset at all.
    #[error("No download source registered for {asset}")]
    NoSource { asset: String },

    /// Download of an asset failed.
    #[error("Failed to download {asset} from {url}: {reason}")]
    Download {
        asset: String,
        url: String,
        reason: String,
    },

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A file the session needs is not on disk.
    #[error("{asset} not found at {}. Run `vicuna pull` first", path.display())]
    AssetMissing { asset: String, path: PathBuf },

    /// The executable could not be launched.
    #[error("Failed to launch {}: {source}", path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A prompt was sent without a running process.
    #[error("Session is not ready. Call start() first")]
    NotReady,

    /// I/O error on the process pipes or the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The process closed its output stream.
    #[error("Inference process exited unexpectedly")]
    ProcessExited,

    /// The session was stopped while the operation was pending.
    #[error("Session was closed")]
    SessionClosed,

    /// The process never printed its prompt marker.
    #[error("Timeout waiting for inference process to become ready after {0:?}")]
    StartupTimeout(Duration),

    /// Configuration could not be resolved.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = VicunaError> = std::result::Result<T, E>;
