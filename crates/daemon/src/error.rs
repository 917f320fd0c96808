use thiserror::Error;

/// Failure kinds surfaced by operation handlers to the queue worker.
///
/// Every variant is terminal for the item that hit it; recovery is always a
/// manual re-enqueue, never an automatic retry.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The source file does not meet the operation's preconditions
    /// (wrong codec, wrong channel layout, no movie file, already queued).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Checksum comparison between source and destination did not match.
    /// The destination artifact has been purged; the source is untouched.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// An external tool (rsync, ffmpeg, ffprobe) could not be spawned or
    /// exited non-zero.
    #[error("external tool failed: {0}")]
    ExternalTool(String),

    /// The catalog API was unreachable, rejected the API key, or returned a
    /// non-2xx status. File-side effects are never rolled back for this kind.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Missing or invalid configuration, detected before any file operation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Local filesystem plumbing around the operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OperationError>;
