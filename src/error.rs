//! Error types for volume storage, binning and transfer operations

use std::fmt;
use std::io;
use thiserror::Error;

/// Recovery path that was attempted before an error surfaced.
///
/// Carried by errors so callers can tell a genuinely missing or broken
/// dataset apart from a lock-contention hiccup that outlasted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPath {
    /// No recovery was attempted
    None,
    /// The `.chk` sidecar was consulted after the embedded header failed validation
    SidecarFallback,
    /// The memory mapping was retried with exponential back-off
    MappingRetry,
    /// The loader retried once after a fixed delay
    LoaderRetry,
}

impl fmt::Display for RecoveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryPath::None => write!(f, "no recovery attempted"),
            RecoveryPath::SidecarFallback => write!(f, "sidecar fallback attempted"),
            RecoveryPath::MappingRetry => write!(f, "mapping retried with back-off"),
            RecoveryPath::LoaderRetry => write!(f, "load retried after delay"),
        }
    }
}

/// Main error type for volume operations
#[derive(Error, Debug)]
pub enum VolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Corrupt header: {reason} ({recovery})")]
    CorruptHeader {
        reason: String,
        recovery: RecoveryPath,
    },

    #[error("Size mismatch: file is {actual} bytes, expected one of {expected:?}")]
    SizeMismatch { actual: u64, expected: Vec<u64> },

    #[error("Transient IO error after {attempts} attempt(s) ({recovery}): {source}")]
    TransientIo {
        #[source]
        source: io::Error,
        attempts: u32,
        recovery: RecoveryPath,
    },

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Chunk {index} write failed: {reason}")]
    ChunkWrite { index: usize, reason: String },

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Specialized Result type for volume operations
pub type Result<T> = std::result::Result<T, VolError>;

impl VolError {
    /// Build a corrupt header error with no recovery attempted
    pub fn corrupt(reason: impl Into<String>) -> Self {
        VolError::CorruptHeader {
            reason: reason.into(),
            recovery: RecoveryPath::None,
        }
    }

    /// True for sharing violations and handles the OS has not released yet.
    ///
    /// Size mismatches, corrupt headers and missing files are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            VolError::Io(err) => is_transient_io(err),
            VolError::TransientIo { .. } => true,
            _ => false,
        }
    }
}

/// Classify an IO error as busy-class: another handle holds the file.
///
/// Plain permission failures are not transient; a read-only or
/// ACL-protected file stays that way however often it is retried.
pub fn is_transient_io(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    match err.raw_os_error() {
        // EBUSY, ETXTBSY, EAGAIN
        #[cfg(unix)]
        Some(16) | Some(26) | Some(11) => true,
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION, ERROR_USER_MAPPED_FILE
        #[cfg(windows)]
        Some(32) | Some(33) | Some(1224) => true,
        _ => false,
    }
}

impl From<serde_json::Error> for VolError {
    fn from(err: serde_json::Error) -> Self {
        VolError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for VolError {
    fn from(err: toml::de::Error) -> Self {
        VolError::Configuration(err.to_string())
    }
}

impl From<image::ImageError> for VolError {
    fn from(err: image::ImageError) -> Self {
        VolError::Image(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let busy = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(is_transient_io(&busy));
        assert!(VolError::Io(busy).is_transient());

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(!is_transient_io(&denied));
        assert!(!VolError::Io(denied).is_transient());

        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert!(!is_transient_io(&missing));

        let mismatch = VolError::SizeMismatch {
            actual: 10,
            expected: vec![8, 44, 48],
        };
        assert!(!mismatch.is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn test_busy_codes_are_transient_but_access_errors_are_not() {
        // EBUSY, ETXTBSY
        assert!(is_transient_io(&io::Error::from_raw_os_error(16)));
        assert!(is_transient_io(&io::Error::from_raw_os_error(26)));
        // EACCES, EPERM, EROFS
        assert!(!is_transient_io(&io::Error::from_raw_os_error(13)));
        assert!(!is_transient_io(&io::Error::from_raw_os_error(1)));
        assert!(!is_transient_io(&io::Error::from_raw_os_error(30)));
    }

    #[cfg(windows)]
    #[test]
    fn test_sharing_codes_are_transient_but_access_denied_is_not() {
        assert!(is_transient_io(&io::Error::from_raw_os_error(32)));
        assert!(is_transient_io(&io::Error::from_raw_os_error(33)));
        assert!(!is_transient_io(&io::Error::from_raw_os_error(5)));
    }

    #[test]
    fn test_error_names_recovery_path() {
        let err = VolError::CorruptHeader {
            reason: "width 0 out of range".to_string(),
            recovery: RecoveryPath::SidecarFallback,
        };
        assert!(err.to_string().contains("sidecar fallback"));
    }
}
