// 上传事件类型定义

use serde::{Deserialize, Serialize};

use crate::uploader::UploadStatus;

/// 上传调度器事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 上传加入调度器（新建或从持久化恢复）
    Added {
        upload_id: String,
        file_name: String,
        relative_path: String,
        file_size: u64,
    },
    /// 进度更新（已节流）
    Progress {
        upload_id: String,
        bytes_uploaded: u64,
        file_size: u64,
        progress: f64,
    },
    /// 状态变更
    StatusChanged {
        upload_id: String,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 等待重试
    Retrying {
        upload_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// 上传完成，服务端已建立视频记录
    Completed { upload_id: String, video_id: String },
    /// 内容重复，等待用户决定
    DuplicatePending {
        upload_id: String,
        duplicate_of_video_id: String,
        duplicate_of_display_path: String,
    },
    /// 上传失败（终态）
    Failed { upload_id: String, error: String },
    /// 从调度器移除
    Removed { upload_id: String },
}

impl UploadEvent {
    pub fn upload_id(&self) -> &str {
        match self {
            UploadEvent::Added { upload_id, .. }
            | UploadEvent::Progress { upload_id, .. }
            | UploadEvent::StatusChanged { upload_id, .. }
            | UploadEvent::Retrying { upload_id, .. }
            | UploadEvent::Completed { upload_id, .. }
            | UploadEvent::DuplicatePending { upload_id, .. }
            | UploadEvent::Failed { upload_id, .. }
            | UploadEvent::Removed { upload_id } => upload_id,
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Added { .. } => "added",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::Retrying { .. } => "retrying",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::DuplicatePending { .. } => "duplicate_pending",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Removed { .. } => "removed",
        }
    }
}
