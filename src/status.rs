//! Status reporting shared by the whole memory stack.
//!
//! Recoverable failures (exhausted allocators, undersized buffers, copies
//! with unknown endpoints) travel as [`Status`] values through [`Result`].
//! Contract violations - out-of-range typed access, copies through a null
//! pointer - panic with a diagnostic instead; continuing past them would
//! operate on an invalid memory region.

use thiserror::Error;

/// Result kind carried by a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0,
    FunctionNotImplemented = 1,
    PathNotValid = 2,
    ModelParseError = 3,
    InternalError = 5,
    KeyAlreadyExists = 6,
    InvalidArgument = 7,
    AllocateFailed = 8,
    DeviceMismatch = 9,
}

/// A result code plus a human-readable message.
///
/// Immutable once constructed except for [`Status::set_message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code:?}: {message}")]
pub struct Status {
    code: StatusCode,
    message: String,
}

/// Result alias used by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Status>;

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Overwrite the diagnostic message, keeping the code.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FunctionNotImplemented, message)
    }

    pub fn path_not_valid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PathNotValid, message)
    }

    pub fn model_parse_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ModelParseError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalError, message)
    }

    pub fn key_already_exists(message: impl Into<String>) -> Self {
        Self::new(StatusCode::KeyAlreadyExists, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn allocate_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::AllocateFailed, message)
    }

    pub fn device_mismatch(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeviceMismatch, message)
    }
}

impl PartialEq<StatusCode> for Status {
    fn eq(&self, other: &StatusCode) -> bool {
        self.code == *other
    }
}

impl PartialEq<Status> for StatusCode {
    fn eq(&self, other: &Status) -> bool {
        *self == other.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_equality_both_directions() {
        let status = Status::invalid_argument("bad dims");
        assert_eq!(status, StatusCode::InvalidArgument);
        assert_eq!(StatusCode::InvalidArgument, status);
        assert_ne!(status, StatusCode::InternalError);
    }

    #[test]
    fn message_can_be_overwritten() {
        let mut status = Status::allocate_failed("first");
        status.set_message("second");
        assert_eq!(status.message(), "second");
        assert_eq!(status.code(), StatusCode::AllocateFailed);
    }

    #[test]
    fn display_includes_code_and_message() {
        let status = Status::device_mismatch("cpu vs cuda");
        assert_eq!(status.to_string(), "DeviceMismatch: cpu vs cuda");
    }
}
