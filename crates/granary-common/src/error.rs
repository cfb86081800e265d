//! Error types for Granary

use thiserror::Error;

/// Result type alias for Granary operations
pub type Result<T> = std::result::Result<T, GranaryError>;

/// Main error type for Granary
///
/// Every provider client, store and engine normalizes its failures into one
/// of these kinds before the error leaves its boundary, so callers can branch
/// on the kind without knowing which protocol produced it.
#[derive(Error, Debug)]
pub enum GranaryError {
    /// Remote endpoint refused, timed out or could not be reached
    #[error("Remote resource error: {0}")]
    RemoteResource(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Destination already holds an object under the `error` duplicate policy
    #[error("Duplicate file: {0}")]
    DuplicateFile(String),

    /// A move would overwrite existing objects that are not copies of the source
    #[error("Move would overwrite existing files: {}", .files.join(", "))]
    OverwriteConflict { files: Vec<String> },

    #[error("Invalid checksum for {file}: expected {algorithm} {expected}, got {actual}")]
    InvalidChecksum {
        file: String,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("Unexpected file size for {file}: expected {expected} bytes, got {actual}")]
    UnexpectedFileSize {
        file: String,
        expected: u64,
        actual: u64,
    },

    /// A product delivery record could not be read or is malformed
    #[error("Invalid PDR {pdr}: {reason}")]
    PdrParse { pdr: String, reason: String },

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Any other protocol-level failure, carrying the original message
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GranaryError {
    /// Whether a caller may retry the failed operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, GranaryError::RemoteResource(_) | GranaryError::Transport(_))
    }

    /// Whether the failure was a transport-level timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            GranaryError::RemoteResource(msg) | GranaryError::Transport(msg) => {
                msg.to_lowercase().contains("timed out")
            },
            GranaryError::Io(e) => {
                matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock)
            },
            _ => false,
        }
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            GranaryError::RemoteResource(_) => "RemoteResourceError",
            GranaryError::FileNotFound(_) => "FileNotFound",
            GranaryError::DuplicateFile(_) => "DuplicateFile",
            GranaryError::OverwriteConflict { .. } => "DuplicateFile",
            GranaryError::InvalidChecksum { .. } => "InvalidChecksum",
            GranaryError::UnexpectedFileSize { .. } => "UnexpectedFileSize",
            GranaryError::PdrParse { .. } => "PDRParsingError",
            GranaryError::DecryptionFailed(_) => "DecryptionFailed",
            GranaryError::Transport(_) => "TransportError",
            GranaryError::InvalidArgument(_) => "InvalidArgument",
            GranaryError::Config(_) => "ConfigurationError",
            GranaryError::Io(_) => "IoError",
            GranaryError::Serialization(_) => "SerializationError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_detection() {
        assert!(GranaryError::Transport("Connection Timed out".into()).is_timeout());
        assert!(GranaryError::RemoteResource("read timed out".into()).is_timeout());
        assert!(!GranaryError::Transport("530 Login incorrect".into()).is_timeout());
        assert!(!GranaryError::FileNotFound("timed out".into()).is_timeout());

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(GranaryError::Io(io).is_timeout());
    }

    #[test]
    fn test_retryable() {
        assert!(GranaryError::RemoteResource("refused".into()).is_retryable());
        assert!(!GranaryError::DuplicateFile("a.txt".into()).is_retryable());
        assert!(!GranaryError::InvalidChecksum {
            file: "a".into(),
            algorithm: "md5".into(),
            expected: "x".into(),
            actual: "y".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_overwrite_conflict_lists_files() {
        let err = GranaryError::OverwriteConflict {
            files: vec!["a.txt".into(), "b.txt".into()],
        };
        assert_eq!(err.to_string(), "Move would overwrite existing files: a.txt, b.txt");
        assert_eq!(err.kind(), "DuplicateFile");
    }
}
