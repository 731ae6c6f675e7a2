// 处理任务 API

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use super::ApiResponse;
use crate::ingest::JobRecord;
use crate::processing::{AdmissionSnapshot, PipelineKind};
use crate::server::{ApiError, ApiResult, AppState};

/// 提交处理任务请求
#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    pub video_id: String,
    /// 缺省时使用配置的默认流水线
    #[serde(default)]
    pub pipeline_kind: Option<PipelineKind>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// POST /api/v1/processing/jobs
pub async fn enqueue_job(
    State(app_state): State<AppState>,
    Json(req): Json<EnqueueJobRequest>,
) -> ApiResult<Json<ApiResponse<JobRecord>>> {
    let kind = req
        .pipeline_kind
        .unwrap_or_else(|| app_state.processing.default_pipeline());
    let parameters = if req.parameters.is_null() {
        serde_json::json!({})
    } else {
        req.parameters
    };
    let job = app_state.processing.enqueue(&req.video_id, kind, parameters)?;
    Ok(Json(ApiResponse::success(job)))
}

/// GET /api/v1/processing/jobs/:id
pub async fn get_job(
    State(app_state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ApiResponse<JobRecord>>> {
    let job = app_state
        .processing
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("处理任务不存在: {}", job_id)))?;
    Ok(Json(ApiResponse::success(job)))
}

/// GET /api/v1/processing/status
/// 运行中、等待中的任务与总容量
pub async fn processing_status(
    State(app_state): State<AppState>,
) -> Json<ApiResponse<AdmissionSnapshot>> {
    Json(ApiResponse::success(app_state.processing.status()))
}
