//! Partial-content delivery of files under the media root.
//!
//! The body is a `ReaderStream` over the seeked file limited to the selected
//! length, so at most one buffer per response is held in memory.

use std::{
    io::{self, SeekFrom},
    path::Path,
};

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::Response,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

use crate::{
    content_type::content_type_for,
    error::{MediaError, MediaResult},
};

/// Upper bound on bytes held in memory per transfer.
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of interpreting a `Range` header against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

impl RangeRequest {
    /// Interprets a `Range: bytes=<start>-<end>` header.
    ///
    /// A missing end, or one past the file, is clamped to the last byte. A
    /// header in another unit, with several ranges, or otherwise unparsable is
    /// ignored and the whole file is served.
    pub fn parse(value: Option<&str>, size: u64) -> Self {
        let Some(value) = value else {
            return Self::Full;
        };
        let Some(ranges) = value.trim().strip_prefix("bytes=") else {
            return Self::Full;
        };
        let ranges = ranges.trim();
        if ranges.contains(',') {
            return Self::Full;
        }
        let Some((start_str, end_str)) = ranges.split_once('-') else {
            return Self::Full;
        };
        let (start_str, end_str) = (start_str.trim(), end_str.trim());

        if start_str.is_empty() {
            // Suffix range: "-N" means the last N bytes.
            let Ok(suffix_len) = end_str.parse::<u64>() else {
                return Self::Full;
            };
            if suffix_len == 0 || size == 0 {
                return Self::Unsatisfiable;
            }
            return Self::Partial {
                start: size - suffix_len.min(size),
                end: size - 1,
            };
        }

        let Ok(start) = start_str.parse::<u64>() else {
            return Self::Full;
        };
        let end = if end_str.is_empty() {
            u64::MAX
        } else {
            match end_str.parse::<u64>() {
                Ok(end) => end,
                Err(_) => return Self::Full,
            }
        };

        if size == 0 || start >= size {
            return Self::Unsatisfiable;
        }
        let end = end.min(size - 1);
        if start > end {
            return Self::Unsatisfiable;
        }
        Self::Partial { start, end }
    }
}

/// Builds the HTTP response for `path`, honoring an optional `Range` header.
///
/// Returns [`MediaError::RangeNotSatisfiable`] for a range outside the file;
/// see [`not_satisfiable`] for the matching response.
pub async fn stream_file(path: &Path, range_header: Option<&str>) -> MediaResult<Response> {
    let mut file = File::open(path)
        .await
        .map_err(|err| MediaError::from_io(err, "file"))?;
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Err(MediaError::not_found("file"));
    }
    let size = metadata.len();

    let (status, start, len) = match RangeRequest::parse(range_header, size) {
        RangeRequest::Full => (StatusCode::OK, 0, size),
        RangeRequest::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        RangeRequest::Unsatisfiable => return Err(MediaError::RangeNotSatisfiable { size }),
    };
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type_for(path))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, len);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, start + len - 1, size),
        );
    }

    builder
        .body(Body::from_stream(ReaderStream::with_capacity(
            file.take(len),
            STREAM_BUFFER_SIZE,
        )))
        .map_err(|err| MediaError::Io(io::Error::other(err)))
}

/// The 416 response: no body, `Content-Range: bytes */{size}`.
pub fn not_satisfiable(size: u64) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
    if let Ok(value) = format!("bytes */{size}").parse() {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, header::HeaderValue::from_static("bytes"));
    response
}
