//! Error types for the ble-request-queue crate.
//!
//! Every request resolves with either a value or one of these errors. The
//! errors also have a bounded integer form (see [`Error::code`]) for
//! consumers that only speak plain integers.

use thiserror::Error;

/// Bit set on every library-defined or unexpected error code.
pub const ERROR_CODE_FLAG: u32 = 0x8000_0000;

/// Offset of the library error codes inside the flagged range.
pub const LIBRARY_ERROR_BASE: u32 = 0x100;

/// Code reported for a successful request.
pub const SUCCESS_CODE: i32 = 0;

/// Failures raised by this library rather than by the radio stack or the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LibraryError {
    /// No link to the peripheral, or the link went down mid-request.
    Disconnected = 0,
    /// The request is not valid in the current connection state.
    InvalidCall = 1,
    /// The request does not match the target's capabilities.
    InvalidParameters = 2,
    /// The request was removed from the queue before completing.
    Canceled = 3,
}

impl LibraryError {
    /// The exported integer code for this library error.
    pub const fn code(self) -> i32 {
        (ERROR_CODE_FLAG | (LIBRARY_ERROR_BASE + self as u32)) as i32
    }
}

/// The main error type for this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer rejected the operation with an ATT/GATT error code.
    #[error("Protocol error: {code:#04x}")]
    Protocol {
        /// ATT error code, in `1..=255`.
        code: u8,
    },

    /// The radio stack reported a connection-layer failure.
    #[error("Transport error: {code}")]
    Transport {
        /// Stack-defined transport error code.
        code: u16,
    },

    /// The operation was attempted or interrupted without an active link.
    #[error("Peripheral disconnected")]
    Disconnected,

    /// The operation is not valid in the current connection state.
    #[error("Invalid call: {reason}")]
    InvalidCall {
        /// Why the call was rejected.
        reason: String,
    },

    /// The request does not match the characteristic or the peripheral.
    #[error("Invalid parameters: {reason}")]
    InvalidParameters {
        /// What was wrong with the request.
        reason: String,
    },

    /// The request was canceled before it completed.
    #[error("Request canceled")]
    Canceled,

    /// A failure that could not be classified.
    #[error("Unexpected error: {message}")]
    Unexpected {
        /// Description of the original failure.
        message: String,
    },
}

impl Error {
    pub(crate) fn invalid_call(reason: impl Into<String>) -> Self {
        Self::InvalidCall {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_parameters(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// The library error kind, if this error was raised by the library.
    pub fn library_error(&self) -> Option<LibraryError> {
        match self {
            Self::Disconnected => Some(LibraryError::Disconnected),
            Self::InvalidCall { .. } => Some(LibraryError::InvalidCall),
            Self::InvalidParameters { .. } => Some(LibraryError::InvalidParameters),
            Self::Canceled => Some(LibraryError::Canceled),
            Self::Protocol { .. } | Self::Transport { .. } | Self::Unexpected { .. } => None,
        }
    }

    /// The bounded integer code for this error.
    ///
    /// - protocol errors pass through unchanged (`1..=255`)
    /// - transport errors map to `-1 - code` (`-65536..=-1`)
    /// - library errors map to `0x80000000 | (0x100 + kind)`
    /// - unexpected errors map to `0x80000000`
    pub fn code(&self) -> i32 {
        match self {
            Self::Protocol { code } => i32::from(*code),
            Self::Transport { code } => -1 - i32::from(*code),
            Self::Unexpected { .. } => ERROR_CODE_FLAG as i32,
            other => match other.library_error() {
                Some(kind) => kind.code(),
                None => ERROR_CODE_FLAG as i32,
            },
        }
    }

    /// Whether retrying the same request on the same link may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

impl From<LibraryError> for Error {
    fn from(kind: LibraryError) -> Self {
        match kind {
            LibraryError::Disconnected => Self::Disconnected,
            LibraryError::InvalidCall => Self::invalid_call("rejected by the radio stack"),
            LibraryError::InvalidParameters => {
                Self::invalid_parameters("rejected by the radio stack")
            }
            LibraryError::Canceled => Self::Canceled,
        }
    }
}

/// The exported integer code for a request outcome.
pub fn error_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => SUCCESS_CODE,
        Err(e) => e.code(),
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_library_codes() {
        assert_eq!(LibraryError::Disconnected.code() as u32, 0x8000_0100);
        assert_eq!(LibraryError::InvalidCall.code() as u32, 0x8000_0101);
        assert_eq!(LibraryError::InvalidParameters.code() as u32, 0x8000_0102);
        assert_eq!(LibraryError::Canceled.code() as u32, 0x8000_0103);
    }

    #[test]
    fn test_passthrough_codes() {
        assert_eq!(Error::Protocol { code: 0x0A }.code(), 0x0A);
        assert_eq!(Error::Transport { code: 0 }.code(), -1);
        assert_eq!(Error::Transport { code: 7 }.code(), -8);
    }

    #[test]
    fn test_unexpected_code() {
        let e = Error::Unexpected {
            message: "boom".to_string(),
        };
        assert_eq!(e.code() as u32, 0x8000_0000);
        assert_eq!(e.library_error(), None);
    }

    #[test]
    fn test_error_code_of_result() {
        let ok: Result<i16> = Ok(-45);
        assert_eq!(error_code(&ok), SUCCESS_CODE);

        let err: Result<()> = Err(Error::Canceled);
        assert_eq!(error_code(&err) as u32, 0x8000_0103);
    }

    #[test]
    fn test_from_library_error() {
        assert_eq!(Error::from(LibraryError::Disconnected), Error::Disconnected);
        assert_eq!(
            Error::from(LibraryError::InvalidParameters).library_error(),
            Some(LibraryError::InvalidParameters)
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Protocol { code: 0x03 }.to_string(),
            "Protocol error: 0x03"
        );
        assert_eq!(
            Error::invalid_call("not connected").to_string(),
            "Invalid call: not connected"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::Protocol { code: 0x0E }.is_recoverable());
        assert!(!Error::Disconnected.is_recoverable());
    }
}
