//! Error taxonomy shared by every media operation.

use std::{io, path::PathBuf};

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    /// The requested path escapes the media root.
    #[error("access outside of the media root is forbidden")]
    PathViolation,

    #[error("{0} not found")]
    NotFound(String),

    #[error("requested range not satisfiable for {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("invalid playlist {}: {reason}", path.display())]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("invalid segment range: from={from} to={to} (segments: {segment_count})")]
    InvalidRange {
        from: usize,
        to: usize,
        segment_count: usize,
    },

    /// Covers both a bad signature and an expired link.
    #[error("expired or invalid")]
    Unauthorized,

    #[error("media probe unavailable: {0}")]
    ProbeUnavailable(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("folder not empty")]
    DirectoryNotEmpty,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Maps an I/O failure on a primary resource, turning a missing file into
    /// [`MediaError::NotFound`].
    pub fn from_io(err: io::Error, what: impl Into<String>) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(what.into())
        } else {
            Self::Io(err)
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::PathViolation => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::InvalidFormat { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidRange { .. } | Self::InvalidName(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::DirectoryNotEmpty => StatusCode::CONFLICT,
            Self::ProbeUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
