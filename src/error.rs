//! Error types for dvault

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for dvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dvault
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (file system operations)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Commit requested with an empty staging list
    #[error("no files staged for commit")]
    NoStagedFiles,

    /// Metadata scanner could not inspect a staged file
    #[error("metadata scan failed for {path}: {message}")]
    MetadataScanFailed { path: PathBuf, message: String },

    /// Snapshot input summed to zero bytes
    #[error("no data to compress")]
    NoData,

    /// Compressed output grew beyond the accepted expansion bound
    #[error("compression expanded output from {original} to {compressed} bytes")]
    CompressionExpanded { original: u64, compressed: u64 },

    /// Compressor produced an empty artifact
    #[error("compression produced empty output: {path}")]
    EmptyOutput { path: PathBuf },

    /// Binary diff computation failed
    #[error("patch computation failed: {message}")]
    PatchComputeFailed { message: String },

    /// Applying a patch during restoration failed
    #[error("patch application failed for version {version}: {message}")]
    PatchFailed { version: u32, message: String },

    /// The delta chain is missing an intermediate artifact
    #[error("delta chain broken at version {version}")]
    ChainBroken { version: u32 },

    /// No artifact exists for the requested version
    #[error("no storage artifact found for version {version}")]
    ArtifactMissing { version: u32 },

    /// Commit record could not be persisted or parsed back
    #[error("commit record error for version {version}: {message}")]
    CommitRecordWriteFailed { version: u32, message: String },

    /// HEAD could not be advanced
    #[error("failed to update HEAD: {message}")]
    HeadUpdateFailed { message: String },

    /// No commit record exists for the requested version
    #[error("no commit record for version {version}")]
    CommitNotFound { version: u32 },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Intermediate archive (zip) errors
    #[error("archive error: {message}")]
    Archive { message: String },

    /// Structured stream is malformed beyond the codec's skip tolerance
    #[error("structured stream error: {message}")]
    Stream { message: String },
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an archive error
    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive {
            message: message.into(),
        }
    }

    /// Create a structured-stream error
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Check if this error indicates repository corruption requiring
    /// operator action (as opposed to a transient or per-commit failure)
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::ChainBroken { .. } | Error::PatchFailed { .. } | Error::ArtifactMissing { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Config {
            message: format!("JSON error: {}", err),
        }
    }
}
