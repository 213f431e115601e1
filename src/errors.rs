use axum::{
    body::Body,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::models::upload_info::{header, TUS_VERSION};
use crate::services::chunk_store::StorageError;

/// Protocol-level failure with its tus HTTP mapping.
///
/// Rendered as a `text/plain` body with a short human message; the canonical
/// tus headers are set where the protocol calls for them (`Tus-Version` on
/// 412, `Content-Range` on 416).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("upload not found")]
    NotFound,

    #[error("{0}")]
    InvalidHeader(String),

    #[error("offset mismatch: upload is at {expected}, request sent {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("PATCH requires Content-Type: application/offset+octet-stream")]
    UnsupportedMediaType,

    #[error("unsupported tus version `{0}`")]
    UnsupportedVersion(String),

    #[error("{0}")]
    SizeExceeded(String),

    #[error("chunk sizes must stay uniform until the final block")]
    UnevenChunks,

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("requested range not satisfiable")]
    RangeUnsatisfiable { length: u64 },

    #[error("upload is already complete")]
    AlreadyFinished,

    #[error("hook failed: {0}")]
    Hook(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn invalid_header(msg: impl Into<String>) -> Self {
        Self::InvalidHeader(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidHeader(_) | Self::UnevenChunks => StatusCode::BAD_REQUEST,
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            Self::SizeExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            // Non-standard tus code for a failed Upload-Checksum.
            Self::ChecksumMismatch => {
                StatusCode::from_u16(460).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::RangeUnsatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::AlreadyFinished => StatusCode::FORBIDDEN,
            Self::Hook(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = Response::new(Body::from(self.to_string()));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(
            axum::http::HeaderName::from_static(header::TUS_RESUMABLE),
            HeaderValue::from_static(TUS_VERSION),
        );
        match &self {
            ProtocolError::UnsupportedVersion(_) => {
                headers.insert(
                    axum::http::HeaderName::from_static(header::TUS_VERSION),
                    HeaderValue::from_static(TUS_VERSION),
                );
            }
            ProtocolError::RangeUnsatisfiable { length } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{length}")) {
                    headers.insert(axum::http::header::CONTENT_RANGE, value);
                }
            }
            _ => {}
        }

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        response
    }
}

impl From<StorageError> for ProtocolError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => ProtocolError::NotFound,
            StorageError::UnevenChunks { .. } => ProtocolError::UnevenChunks,
            StorageError::MaxSizeExceeded { read } => ProtocolError::SizeExceeded(format!(
                "upload exceeds the maximum size after {read} bytes"
            )),
            other => ProtocolError::Internal(other.to_string()),
        }
    }
}
