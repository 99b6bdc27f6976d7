//! Engine error type.
//!
//! Errors are constructed on the audio thread, so the message is bounded
//! inline storage rather than a heap string.

use arrayvec::ArrayString;
use hc_proto::ErrorKind;

/// Maximum length of an error message carried to the worker.
pub const MAX_ERROR_MESSAGE: usize = 96;

/// An engine error: a protocol error kind plus a short message.
#[derive(Clone, Debug)]
pub struct EngineError {
    kind: ErrorKind,
    message: ArrayString<MAX_ERROR_MESSAGE>,
}

impl EngineError {
    /// Error with the kind name as its message.
    pub fn new(kind: ErrorKind) -> Self {
        Self::with_message(kind, kind.as_str())
    }

    /// Error with an explicit message, truncated to the inline capacity.
    pub fn with_message(kind: ErrorKind, message: &str) -> Self {
        let mut buf = ArrayString::new();
        for ch in message.chars() {
            if buf.try_push(ch).is_err() {
                break;
            }
        }
        Self { kind, message: buf }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.as_str() == self.kind.as_str() {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for EngineError {}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_leads_with_kind_name() {
        let err = EngineError::new(ErrorKind::NodeIdError);
        assert_eq!(err.to_string(), "NodeIdError");

        let err = EngineError::with_message(ErrorKind::ArgumentRange, "control index 9 out of range");
        assert_eq!(err.to_string(), "ArgumentRange: control index 9 out of range");
    }

    #[test]
    fn long_messages_truncate_instead_of_allocating() {
        let long = "x".repeat(500);
        let err = EngineError::with_message(ErrorKind::AllocFailure, &long);
        assert_eq!(err.message().len(), MAX_ERROR_MESSAGE);
    }
}
