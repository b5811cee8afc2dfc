//! Translation of radio-stack failures into [`Error`].
//!
//! The radio stack reports failures in its own terms. They are folded into
//! the crate taxonomy here, and nowhere else.

use crate::error::{Error, LibraryError, Result};

/// Smallest ATT error code (`0x00` is not an error).
pub const MIN_PROTOCOL_CODE: i64 = 0x01;
/// Largest ATT error code.
pub const MAX_PROTOCOL_CODE: i64 = 0xFF;
/// Largest transport error code that passes through unchanged.
pub const MAX_TRANSPORT_CODE: i64 = u16::MAX as i64;

/// A failure as reported by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackFailure {
    /// ATT/GATT error returned by the peer.
    Protocol(i64),
    /// Connection-layer error raised by the local stack.
    Transport(i64),
    /// Failure defined by this library, raised on the stack's behalf.
    Library(LibraryError),
    /// Failure from any other source.
    Foreign {
        /// Name of the originating error domain.
        domain: String,
        /// Code within that domain.
        code: i64,
    },
}

impl StackFailure {
    /// Translate into the crate's error taxonomy.
    ///
    /// Codes outside the protocol/transport ranges, and foreign failures,
    /// become [`Error::Unexpected`].
    pub fn into_error(self) -> Error {
        match self {
            Self::Protocol(code) if (MIN_PROTOCOL_CODE..=MAX_PROTOCOL_CODE).contains(&code) => {
                Error::Protocol { code: code as u8 }
            }
            Self::Protocol(code) => Error::Unexpected {
                message: format!("protocol error code {code} out of range"),
            },
            Self::Transport(code) if (0..=MAX_TRANSPORT_CODE).contains(&code) => {
                Error::Transport { code: code as u16 }
            }
            Self::Transport(code) => Error::Unexpected {
                message: format!("transport error code {code} out of range"),
            },
            Self::Library(kind) => kind.into(),
            Self::Foreign { domain, code } => Error::Unexpected {
                message: format!("{domain} error {code}"),
            },
        }
    }
}

impl From<StackFailure> for Error {
    fn from(failure: StackFailure) -> Self {
        failure.into_error()
    }
}

impl From<LibraryError> for StackFailure {
    fn from(kind: LibraryError) -> Self {
        Self::Library(kind)
    }
}

/// Translate an optional stack failure; `None` means success.
pub fn translate(failure: Option<StackFailure>) -> Result<()> {
    match failure {
        None => Ok(()),
        Some(failure) => Err(failure.into_error()),
    }
}

/// Translate a stack result carrying a value.
pub fn translate_result<T>(result: std::result::Result<T, StackFailure>) -> Result<T> {
    result.map_err(StackFailure::into_error)
}
