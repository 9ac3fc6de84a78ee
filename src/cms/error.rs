//! Error types for the CMake Server client

use std::path::PathBuf;

use crate::cache::CacheError;
use crate::cms::codec::CodecError;
use crate::io::ProcessError;

#[derive(Debug, thiserror::Error)]
pub enum CmsError {
    /// Server exited before the handshake finished
    #[error("CMake Server exited during startup (exit code {exit_code:?})")]
    StartupFailed { exit_code: Option<i32> },

    /// The build directory belongs to another source directory
    #[error(
        "Build directory cache {bad_cache_path} was configured for {cached}, expected {expecting}"
    )]
    BadHomeDirectory {
        cached: PathBuf,
        expecting: PathBuf,
        bad_cache_path: PathBuf,
    },

    /// Fresh configure and no generator could be picked
    #[error("No usable CMake generator found")]
    NoGenerator,

    #[error("Pipe error: {0}")]
    Pipe(#[from] std::io::Error),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// An `error` reply to a request
    #[error("CMake Server rejected '{request}': {message}")]
    Server { request: String, message: String },

    #[error("Connection to CMake Server closed")]
    ConnectionClosed,

    #[error("CMake Server exited (exit code {exit_code:?})")]
    ProcessExited { exit_code: Option<i32> },

    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Failed to serialize request: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Unexpected reply to '{request}': {source}")]
    Deserialization {
        request: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CmsError {
    pub fn server(request: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            request: request.into(),
            message: message.into(),
        }
    }

    /// Errors that leave the connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::ProcessExited { .. }
                | Self::Pipe(_)
                | Self::Codec(_)
                | Self::ShuttingDown
        )
    }
}
