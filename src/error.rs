//! Error types for the duplex audio subsystem

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Open failed: {0}")]
    Open(#[from] OpenError),

    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Recovery failed after {attempts} attempts: {last}")]
    RecoveryFailed { attempts: u32, last: OpenError },

    #[error("Stream is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported synchronously while opening a backend.
///
/// The selector uses the variant to decide whether the next backend in
/// its preference order is worth trying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Backend {backend} cannot serve role {role}")]
    RoleIncompatible { backend: String, role: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("No backend could be opened ({})", summarize(.0))]
    NoBackendAvailable(Vec<(String, OpenError)>),
}

impl OpenError {
    /// Whether a more conservative backend may succeed where this one failed.
    ///
    /// A refused permission belongs to the user, not the backend, so no
    /// other backend will be granted it either.
    pub fn allows_fallback(&self) -> bool {
        !matches!(
            self,
            OpenError::PermissionDenied(_) | OpenError::NoBackendAvailable(_)
        )
    }
}

fn summarize(attempts: &[(String, OpenError)]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by a native host implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("device busy")]
    DeviceBusy,

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("host error: {0}")]
    Host(String),
}

impl From<NativeError> for OpenError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::PermissionDenied => OpenError::PermissionDenied("capture refused".into()),
            NativeError::DeviceBusy => OpenError::DeviceBusy("device in use".into()),
            NativeError::InvalidFormat(msg) => OpenError::UnsupportedFormat(msg),
            NativeError::Unavailable(msg) => OpenError::DeviceNotFound(msg),
            NativeError::Unsupported(msg) => OpenError::Backend(msg),
            NativeError::Host(msg) => OpenError::Backend(msg),
        }
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_mapping() {
        assert_eq!(
            OpenError::from(NativeError::DeviceBusy),
            OpenError::DeviceBusy("device in use".into())
        );
        assert!(matches!(
            OpenError::from(NativeError::InvalidFormat("7ch".into())),
            OpenError::UnsupportedFormat(_)
        ));
    }

    #[test]
    fn test_no_backend_message_lists_attempts() {
        let err = OpenError::NoBackendAvailable(vec![
            ("streaming".into(), OpenError::DeviceBusy("x".into())),
            ("queue".into(), OpenError::PermissionDenied("y".into())),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("streaming: Device busy: x"));
        assert!(msg.contains("queue: Permission denied: y"));
        assert!(!err.allows_fallback());
    }

    #[test]
    fn test_fallback_stops_on_refused_permission() {
        assert!(!OpenError::PermissionDenied("mic".into()).allows_fallback());
        assert!(OpenError::DeviceBusy("x".into()).allows_fallback());
        assert!(OpenError::UnsupportedFormat("x".into()).allows_fallback());
        assert!(OpenError::RoleIncompatible {
            backend: "streaming".into(),
            role: "voice".into(),
        }
        .allows_fallback());
    }
}
