//! Shared error vocabulary used across every layer of the fabric (spec §7).

use std::fmt;
use std::io;

/// Wire-level error kind. Serialized as part of a [`crate::codec::Response`]
/// whenever a handler fails; reconstituted by the caller without parsing
/// the human-readable message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Path or handle absent.
    NotFound,
    /// Bad whence, negative length, seek past EOF, write intent, etc.
    Invalid,
    /// Write attempted against a read-only filesystem.
    PermissionDenied,
    /// Underlying syscall failed.
    Io,
    /// Deadline exceeded.
    Timeout,
    /// Context/session canceled.
    Canceled,
    /// Feature not supported by the platform and no fallback applies.
    Unsupported,
    /// Handler panicked; never constructed directly outside the router.
    Internal,
}

impl ErrorKind {
    /// HTTP-style status this kind maps onto on the wire (spec §4.4, §7).
    pub fn status(self) -> u32 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Invalid => 400,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::Io
            | ErrorKind::Timeout
            | ErrorKind::Canceled
            | ErrorKind::Unsupported
            | ErrorKind::Internal => 500,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::Io => "io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Internal => "invalid",
        }
    }

    /// Parses the kind back from its wire string representation.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "not-found" => ErrorKind::NotFound,
            "invalid" => ErrorKind::Invalid,
            "permission-denied" => ErrorKind::PermissionDenied,
            "io" => ErrorKind::Io,
            "timeout" => ErrorKind::Timeout,
            "canceled" => ErrorKind::Canceled,
            "unsupported" => ErrorKind::Unsupported,
            _ => return None,
        })
    }
}

/// A typed error carrying both a [`ErrorKind`] and a short human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FabricError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for FabricError {}

impl From<io::Error> for FabricError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::Invalid,
            _ => ErrorKind::Io,
        };
        FabricError::new(kind, err.to_string())
    }
}

/// Convenient result alias used throughout the crate, mirroring the
/// teacher's `parser::Result` / `vfs::VfsResult` aliases.
pub type Result<T> = std::result::Result<T, FabricError>;
