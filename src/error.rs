//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result<T>`]. Bus-level
//! failures never unwind; the adapter and protocol engines convert every
//! failure path into an [`Error`] carrying a [`Kind`], a human-readable
//! message, and an optional causal chain.

use std::fmt;

use crate::memory_id::MemoryId;

pub type Result<T> = std::result::Result<T, Error>;

/// The kind of failure, independent of the human-readable message.
///
/// `spec.md` §7 fixes this set; engines recover only from transient
/// [`Kind::Io`] via bounded retry, everything else bubbles up unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    NotConnected,
    Busy,
    InvalidArgument,
    UnsupportedOperation,
    UnknownChip,
    Timeout,
    Io,
    ProtocolError,
    VerifyMismatch,
    Cancelled,
    Internal,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::NotConnected => "not connected",
            Kind::Busy => "busy",
            Kind::InvalidArgument => "invalid argument",
            Kind::UnsupportedOperation => "unsupported operation",
            Kind::UnknownChip => "unknown chip",
            Kind::Timeout => "timeout",
            Kind::Io => "I/O error",
            Kind::ProtocolError => "protocol error",
            Kind::VerifyMismatch => "verify mismatch",
            Kind::Cancelled => "cancelled",
            Kind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type.
///
/// Carries the originating [`Kind`], a message meant for humans, and an
/// optional boxed cause for I/O-level failures that came from `rusb` or
/// `std::io`.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: Kind,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    /// Populated only for `Kind::UnknownChip`, per `spec.md` §4.6: the
    /// detected id is still reported to the caller for UI display even
    /// though the chip could not be looked up.
    pub memory_id: Option<MemoryId>,
    /// Populated only for `Kind::VerifyMismatch`.
    pub verify: Option<VerifyMismatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyMismatch {
    pub offset: u64,
    pub expected: u8,
    pub actual: u8,
}

impl Error {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            memory_id: None,
            verify: None,
        }
    }

    pub fn with_cause(
        kind: Kind,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Box::new(cause)),
            memory_id: None,
            verify: None,
        }
    }

    pub fn unknown_chip(id: MemoryId) -> Self {
        Self {
            kind: Kind::UnknownChip,
            message: format!("no descriptor matches {id}"),
            cause: None,
            memory_id: Some(id),
            verify: None,
        }
    }

    pub fn verify_mismatch(offset: u64, expected: u8, actual: u8) -> Self {
        Self {
            kind: Kind::VerifyMismatch,
            message: format!(
                "mismatch at offset {offset:#010x}: expected {expected:#04x}, got {actual:#04x}"
            ),
            cause: None,
            memory_id: None,
            verify: Some(VerifyMismatch {
                offset,
                expected,
                actual,
            }),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidArgument, message)
    }

    pub fn unsupported(bus: &str) -> Self {
        Self::new(Kind::UnsupportedOperation, format!("{bus} not supported"))
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Kind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(Kind::Cancelled, "operation cancelled")
    }

    pub fn is_transient_io(&self) -> bool {
        self.kind == Kind::Io
    }
}

impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        Error::with_cause(Kind::Io, "USB transfer failed", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_chip_carries_memory_id() {
        let id = MemoryId::from_jedec([0xEF, 0x40, 0x16]);
        let err = Error::unknown_chip(id);
        assert_eq!(err.kind, Kind::UnknownChip);
        assert_eq!(err.memory_id, Some(id));
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::invalid_argument("page crossing");
        let text = format!("{err}");
        assert!(text.contains("invalid argument"));
        assert!(text.contains("page crossing"));
    }
}
