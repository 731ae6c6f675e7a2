// API 错误 -> HTTP 响应

use axum::{
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::{error, warn};

use crate::ingest::{GateError, IngestError, SessionError};
use crate::processing::QueueError;
use crate::protocol::{ApiResponse, TUS_VERSION};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    /// 偏移量不匹配，携带服务端偏移量
    #[error("偏移量不匹配，服务端偏移量 {0}")]
    OffsetMismatch(u64),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    InsufficientStorage(String),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) | ApiError::OffsetMismatch(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InsufficientStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            error!("请求处理失败: {}", message);
        } else {
            warn!("请求被拒绝: {} {}", status.as_u16(), message);
        }

        let mut response = (
            status,
            Json(ApiResponse::<()>::error(status.as_u16() as i32, message)),
        )
            .into_response();

        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static("tus-resumable"),
            HeaderValue::from_static(TUS_VERSION),
        );
        if let ApiError::OffsetMismatch(offset) = self {
            if let Ok(v) = HeaderValue::from_str(&offset.to_string()) {
                headers.insert(HeaderName::from_static("upload-offset"), v);
            }
        }
        response
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        if e.is_storage_full() {
            return ApiError::InsufficientStorage(e.to_string());
        }
        match e {
            SessionError::NotFound(_) => ApiError::NotFound(e.to_string()),
            SessionError::OffsetMismatch { actual, .. } => ApiError::OffsetMismatch(actual),
            SessionError::TooLarge(_) => ApiError::PayloadTooLarge(e.to_string()),
            SessionError::Incomplete { .. } | SessionError::Invalid(_) => {
                ApiError::BadRequest(e.to_string())
            }
            SessionError::Storage(io) => ApiError::Internal(anyhow::Error::from(io)),
        }
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::NotFound(_) => ApiError::NotFound(e.to_string()),
            GateError::AlreadyDecided(_) => ApiError::Conflict(e.to_string()),
            GateError::Storage(inner) => ApiError::Internal(inner),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Session(e) => e.into(),
            IngestError::Gate(e) => e.into(),
            IngestError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::VideoNotFound(_) => ApiError::NotFound(e.to_string()),
            QueueError::NotInError(_) => ApiError::Conflict(e.to_string()),
            QueueError::Storage(inner) => ApiError::Internal(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_mismatch_carries_server_offset() {
        let err: ApiError = SessionError::OffsetMismatch {
            requested: 0,
            actual: 42,
        }
        .into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(resp.headers()["upload-offset"], "42");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(SessionError::TooLarge("x".into())).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        let enospc = std::io::Error::from_raw_os_error(28);
        assert_eq!(
            ApiError::from(SessionError::Storage(enospc)).status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            ApiError::from(GateError::AlreadyDecided("keep_both")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(QueueError::NotInError("v".into())).status(),
            StatusCode::CONFLICT
        );
    }
}
