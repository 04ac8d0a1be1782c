//! Error taxonomy surfaced to IPC callers

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors a device or registry method can return to a caller.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The device must be claimed before this operation
    #[error("Device was not claimed before use")]
    ClaimRequired,

    /// The device is claimed by someone else, or an operation is running
    #[error("Device already in use: {0}")]
    AlreadyInUse(String),

    /// The authorization gate refused the action
    #[error("Not authorized: {0}")]
    PermissionDenied(String),

    /// The user has no enrolled fingerprints
    #[error("No fingerprints enrolled")]
    NoEnrolledPrints,

    /// Stop was called with nothing running
    #[error("No action currently in progress")]
    NoActionInProgress,

    /// The finger name passed was invalid
    #[error("Invalid finger name")]
    InvalidFingerName,

    /// The device does not exist
    #[error("No such device")]
    NoSuchDevice,

    /// Internal failure (hardware open/close, storage)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ClaimRequired => ErrorCode::ClaimDevice,
            Error::AlreadyInUse(_) => ErrorCode::AlreadyInUse,
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::NoEnrolledPrints => ErrorCode::NoEnrolledPrints,
            Error::NoActionInProgress => ErrorCode::NoActionInProgress,
            Error::InvalidFingerName => ErrorCode::InvalidFingername,
            Error::NoSuchDevice => ErrorCode::NoSuchDevice,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Reconstruct an error from its wire code and message.
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::ClaimDevice => Error::ClaimRequired,
            ErrorCode::AlreadyInUse => Error::AlreadyInUse(message),
            ErrorCode::PermissionDenied => Error::PermissionDenied(message),
            ErrorCode::NoEnrolledPrints => Error::NoEnrolledPrints,
            ErrorCode::NoActionInProgress => Error::NoActionInProgress,
            ErrorCode::InvalidFingername => Error::InvalidFingerName,
            ErrorCode::NoSuchDevice => Error::NoSuchDevice,
            ErrorCode::Internal => Error::Internal(message),
        }
    }
}

/// Stable wire identifiers for [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ClaimDevice,
    AlreadyInUse,
    Internal,
    PermissionDenied,
    NoEnrolledPrints,
    NoActionInProgress,
    InvalidFingername,
    NoSuchDevice,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let errors = [
            Error::ClaimRequired,
            Error::AlreadyInUse("busy".into()),
            Error::PermissionDenied("verify".into()),
            Error::NoEnrolledPrints,
            Error::NoActionInProgress,
            Error::InvalidFingerName,
            Error::NoSuchDevice,
            Error::Internal("boom".into()),
        ];

        for err in errors {
            let code = err.code();
            let back = Error::from_wire(code, err.to_string());
            assert_eq!(back.code(), code);
        }
    }
}
