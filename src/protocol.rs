// 客户端与服务端共用的协议类型

use serde::{Deserialize, Serialize};

/// 协议版本
pub const TUS_VERSION: &str = "1.0.0";

pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// 统一 API 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// 状态码 (0: 成功, 其他: 错误码)
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }
}

/// 上传完成后的服务端结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// 已建立视频记录
    Success { video_id: String },
    /// 内容与已有视频重复，等待用户决定
    PendingDuplicate {
        duplicate_of_video_id: String,
        duplicate_of_display_path: String,
    },
}

/// 重复内容的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateDecision {
    /// 保留两份
    KeepBoth,
    /// 删除旧视频，保留新上传
    ReplaceExisting,
    /// 放弃本次上传
    CancelUpload,
}

impl DuplicateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateDecision::KeepBoth => "keep_both",
            DuplicateDecision::ReplaceExisting => "replace_existing",
            DuplicateDecision::CancelUpload => "cancel_upload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keep_both" => Some(DuplicateDecision::KeepBoth),
            "replace_existing" => Some(DuplicateDecision::ReplaceExisting),
            "cancel_upload" => Some(DuplicateDecision::CancelUpload),
            _ => None,
        }
    }
}

/// 决定请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub decision: DuplicateDecision,
}

/// 决定执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: DuplicateDecision,
    /// keep_both / replace_existing 时为新视频 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
}

/// 路径存在性查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
}
