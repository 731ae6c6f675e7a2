// 可续传上传会话 API

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use super::ApiResponse;
use crate::ingest::parse_upload_metadata;
use crate::protocol::{
    DecisionOutcome, DecisionRequest, FinalizeOutcome, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_OFFSET, TUS_VERSION,
};
use crate::server::{ApiError, ApiResult, AppState};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn required_u64(headers: &HeaderMap, name: &str) -> ApiResult<u64> {
    header_str(headers, name)
        .ok_or_else(|| ApiError::BadRequest(format!("缺少 {} 头", name)))?
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("无效的 {} 头", name)))
}

fn tus_headers(pairs: &[(&str, u64)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("tus-resumable"),
        HeaderValue::from_static(TUS_VERSION),
    );
    for (name, value) in pairs {
        // HeaderName::from_bytes 会统一转为小写
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.insert(name, HeaderValue::from(*value));
        }
    }
    headers
}

/// POST /api/v1/uploads
/// 创建上传会话
pub async fn create_upload(
    State(app_state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let upload_length = required_u64(&headers, HEADER_UPLOAD_LENGTH)?;
    let metadata = parse_upload_metadata(header_str(&headers, HEADER_UPLOAD_METADATA).unwrap_or(""))?;

    let session = app_state
        .ingest
        .sessions()
        .create(upload_length, metadata)
        .await?;

    let location = format!("/api/v1/uploads/{}", session.id);
    let mut resp_headers = tus_headers(&[]);
    resp_headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&location).map_err(|e| anyhow::anyhow!("无效的 Location: {}", e))?,
    );

    Ok((
        StatusCode::CREATED,
        resp_headers,
        Json(ApiResponse::success(session)),
    )
        .into_response())
}

/// HEAD /api/v1/uploads/:id
/// 查询当前偏移量
pub async fn upload_offset(
    State(app_state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let (offset, length) = app_state.ingest.sessions().offset(&session_id).await?;
    let mut headers = tus_headers(&[(HEADER_UPLOAD_OFFSET, offset), (HEADER_UPLOAD_LENGTH, length)]);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok((StatusCode::OK, headers).into_response())
}

/// PATCH /api/v1/uploads/:id
/// 在 Upload-Offset 处追加一个分片
pub async fn append_chunk(
    State(app_state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let offset = required_u64(&headers, HEADER_UPLOAD_OFFSET)?;
    let new_offset = app_state
        .ingest
        .sessions()
        .append(&session_id, offset, &body)
        .await?;
    Ok((
        StatusCode::NO_CONTENT,
        tus_headers(&[(HEADER_UPLOAD_OFFSET, new_offset)]),
    )
        .into_response())
}

/// DELETE /api/v1/uploads/:id
/// 终止上传会话
pub async fn terminate_upload(
    State(app_state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    if !app_state.ingest.terminate(&session_id).await? {
        return Err(ApiError::NotFound(format!("上传会话不存在: {}", session_id)));
    }
    info!("上传会话已终止: {}", session_id);
    Ok((StatusCode::NO_CONTENT, tus_headers(&[])).into_response())
}

/// POST /api/v1/uploads/:id/finalize
/// 字节完整后入库
pub async fn finalize_upload(
    State(app_state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<ApiResponse<FinalizeOutcome>>> {
    let outcome = app_state.ingest.finalize(&session_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// POST /api/v1/uploads/:id/duplicate-decision
/// 对重复内容做出决定
pub async fn duplicate_decision(
    State(app_state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<Json<ApiResponse<DecisionOutcome>>> {
    let outcome = app_state
        .ingest
        .resolve_duplicate(&session_id, req.decision)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}
