// 视频查询 API

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use super::ApiResponse;
use crate::ingest::{JobRecord, VideoRecord};
use crate::protocol::ExistsResponse;
use crate::server::{ApiError, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ExistsQuery {
    pub path: String,
}

/// GET /api/v1/videos/exists?path=
/// 按相对路径检查是否已有同名视频（仅作提示，不参与入库判断）
pub async fn video_exists(
    State(app_state): State<AppState>,
    Query(query): Query<ExistsQuery>,
) -> ApiResult<Json<ApiResponse<ExistsResponse>>> {
    let video = app_state.ingest.find_by_path(&query.path)?;
    Ok(Json(ApiResponse::success(ExistsResponse {
        exists: video.is_some(),
        video_id: video.map(|v| v.id),
    })))
}

/// GET /api/v1/videos/:id
pub async fn get_video(
    State(app_state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<ApiResponse<VideoRecord>>> {
    let video = app_state
        .ingest
        .get_video(&video_id)?
        .ok_or_else(|| ApiError::NotFound(format!("视频不存在: {}", video_id)))?;
    Ok(Json(ApiResponse::success(video)))
}

/// POST /api/v1/videos/:id/retry
/// 重新提交处理失败的视频
pub async fn retry_video(
    State(app_state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<ApiResponse<JobRecord>>> {
    let job = app_state.processing.retry_video(&video_id)?;
    Ok(Json(ApiResponse::success(job)))
}
