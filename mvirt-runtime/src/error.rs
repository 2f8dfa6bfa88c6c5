//! Error types for the task manager.

use std::io;
use thiserror::Error;
use tonic::{Code, Status};

/// Machine-checkable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    InvalidArgument,
    Unavailable,
    Canceled,
    DeadlineExceeded,
    Internal,
}

impl From<Code> for ErrorKind {
    fn from(code: Code) -> Self {
        match code {
            Code::NotFound => ErrorKind::NotFound,
            Code::AlreadyExists => ErrorKind::AlreadyExists,
            Code::FailedPrecondition => ErrorKind::FailedPrecondition,
            Code::InvalidArgument => ErrorKind::InvalidArgument,
            Code::Unavailable => ErrorKind::Unavailable,
            Code::Cancelled => ErrorKind::Canceled,
            Code::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}: not found")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A task call failed on the shim side.
    #[error("{op} {id}: {status}")]
    Rpc {
        op: &'static str,
        id: String,
        #[source]
        status: Status,
    },

    #[error("failed to connect to shim at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("shim bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Shim(#[from] mvirt_shim::Error),
}

impl Error {
    pub fn rpc(op: &'static str, id: impl Into<String>, status: Status) -> Self {
        Error::Rpc {
            op,
            id: id.into(),
            status,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Rpc { status, .. } => status.code().into(),
            Error::Connect { .. } => ErrorKind::Unavailable,
            Error::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            Error::Shim(e) => match e.kind() {
                mvirt_shim::ErrorKind::NotFound => ErrorKind::NotFound,
                mvirt_shim::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                mvirt_shim::ErrorKind::FailedPrecondition => ErrorKind::FailedPrecondition,
                mvirt_shim::ErrorKind::InvalidArgument => ErrorKind::InvalidArgument,
                mvirt_shim::ErrorKind::Unavailable => ErrorKind::Unavailable,
                mvirt_shim::ErrorKind::Internal => ErrorKind::Internal,
            },
            Error::Bootstrap(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// The caller gave up on the call; cleanup must not depend on it.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Canceled | ErrorKind::DeadlineExceeded
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_kind_survives() {
        let err = Error::rpc("start", "c1", Status::not_found("c1: not found"));
        assert!(err.is_not_found());

        let err = Error::rpc("exec", "c1", Status::already_exists("e1"));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = Error::rpc("create", "c1", Status::deadline_exceeded("slow"));
        assert!(err.is_cancellation());

        let err = Error::rpc("kill", "c1", Status::internal("boom"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_shim_kind_mapped() {
        let err: Error = mvirt_shim::Error::FailedPrecondition("paused".into()).into();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }
}
