//! Error types for the shim.

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
    Internal,
}

/// Main error type for shim operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}: not found")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The OCI runtime failed an operation on a container.
    #[error("{op} {id}: {source}")]
    Runtime {
        op: &'static str,
        id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("cgroup error: {0}")]
    Cgroup(#[from] CgroupError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the OCI runtime binary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to execute {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("{binary} exited with status {status}: {stderr}")]
    Failed {
        binary: String,
        status: i32,
        stderr: String,
    },

    #[error("{0}")]
    Protocol(String),
}

/// Cgroup filesystem errors.
#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("cgroup {0} does not exist")]
    Missing(String),

    #[error("controller {0} is not available")]
    ControllerUnavailable(String),

    #[error("failed to parse {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn runtime(op: &'static str, id: impl Into<String>, source: RuntimeError) -> Self {
        Error::Runtime {
            op,
            id: id.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Error::InvalidArgument(_) | Error::Json(_) => ErrorKind::InvalidArgument,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            Error::Runtime { .. } | Error::Cgroup(_) | Error::Io(_) | Error::Nix(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        let code = match e.kind() {
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::FailedPrecondition => Code::FailedPrecondition,
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::Unavailable => Code::Unavailable,
            ErrorKind::Internal => Code::Internal,
        };
        Status::new(code, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let status: Status = Error::NotFound("process e1".into()).into();
        assert_eq!(status.code(), Code::NotFound);

        let status: Status = Error::AlreadyExists("id e1".into()).into();
        assert_eq!(status.code(), Code::AlreadyExists);

        let status: Status = Error::runtime(
            "start",
            "c1",
            RuntimeError::Failed {
                binary: "runc".into(),
                status: 1,
                stderr: "boom".into(),
            },
        )
        .into();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("start c1"));
        assert!(status.message().contains("boom"));
    }

    #[test]
    fn test_io_not_found_kind() {
        let err = Error::Io(io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());
    }
}
