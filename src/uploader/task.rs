// 上传元数据与状态机定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// 上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 刚创建，尚未入队
    Pending,
    /// 排队等待并发槽位
    Queued,
    /// 传输中
    Uploading,
    /// 已完成
    Complete,
    /// 失败（可手动重试）
    Error,
    /// 用户暂停
    Paused,
    /// 长时间没有字节进度
    Stalled,
    /// 等待重试
    Retrying,
    /// 内容重复，等待用户决定
    DuplicatePending,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    /// 状态转换表
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Uploading) => true,
            (Uploading, Complete | DuplicatePending | Stalled | Retrying) => true,
            (Stalled, Retrying) => true,
            (Retrying, Uploading) => true,
            (Queued | Uploading | Stalled | Retrying, Paused) => true,
            (Paused, Queued) => true,
            // 手动重试
            (Error, Queued) => true,
            (DuplicatePending, Complete) => true,
            (Pending | Queued | Uploading | Stalled | Retrying | Paused | DuplicatePending, Error) => {
                true
            }
            (Pending | Queued | Uploading | Stalled | Retrying | Paused | DuplicatePending, Cancelled) => {
                true
            }
            _ => false,
        }
    }

    /// 是否占用并发槽位
    ///
    /// 停滞和等待重试期间仍占用槽位，避免重试时被后来者抢占
    pub fn holds_slot(self) -> bool {
        matches!(
            self,
            UploadStatus::Uploading | UploadStatus::Stalled | UploadStatus::Retrying
        )
    }

    /// 终态：调度器不会再主动推进
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Complete | UploadStatus::Cancelled | UploadStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Complete => "complete",
            UploadStatus::Error => "error",
            UploadStatus::Paused => "paused",
            UploadStatus::Stalled => "stalled",
            UploadStatus::Retrying => "retrying",
            UploadStatus::DuplicatePending => "duplicate_pending",
            UploadStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 非法状态转换
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("非法状态转换: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: UploadStatus,
    pub to: UploadStatus,
}

/// 服务端报告的重复信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateInfo {
    pub duplicate_of_video_id: String,
    pub duplicate_of_display_path: String,
}

/// 单个文件的上传元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// 上传 ID（重启后保持不变）
    pub id: String,
    pub file_name: String,
    /// 相对于拖入目录的路径
    pub relative_path: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    pub file_size: u64,
    /// 已确认上传的字节数
    pub bytes_uploaded: u64,
    pub status: UploadStatus,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    /// 最后活动时间（毫秒时间戳）
    pub last_activity_at: i64,
    pub retry_count: u32,
    /// 断点续传会话句柄
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_handle: Option<String>,
    /// 服务端分配的视频 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateInfo>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl UploadMetadata {
    pub fn new(local_path: PathBuf, relative_path: String, file_size: u64) -> Self {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| relative_path.clone());
        let now = now_millis();

        Self {
            id: Uuid::new_v4().to_string(),
            file_name,
            relative_path,
            local_path,
            file_size,
            bytes_uploaded: 0,
            status: UploadStatus::Pending,
            created_at: now,
            last_activity_at: now,
            retry_count: 0,
            session_handle: None,
            video_id: None,
            error: None,
            duplicate: None,
        }
    }

    /// 按转换表切换状态，返回旧状态
    pub fn transition(&mut self, next: UploadStatus) -> Result<UploadStatus, InvalidTransition> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.status = next;
        self.last_activity_at = now_millis();
        Ok(from)
    }

    /// 记录服务端确认的偏移量，超出文件大小时截断
    pub fn set_offset(&mut self, offset: u64) {
        self.bytes_uploaded = offset.min(self.file_size);
        self.last_activity_at = now_millis();
    }

    /// 进度百分比
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 100.0;
        }
        (self.bytes_uploaded as f64 / self.file_size as f64) * 100.0
    }

    pub fn mark_complete(&mut self, video_id: String) -> Result<UploadStatus, InvalidTransition> {
        let old = self.transition(UploadStatus::Complete)?;
        self.bytes_uploaded = self.file_size;
        self.video_id = Some(video_id);
        self.duplicate = None;
        self.error = None;
        Ok(old)
    }

    pub fn mark_duplicate_pending(
        &mut self,
        info: DuplicateInfo,
    ) -> Result<UploadStatus, InvalidTransition> {
        let old = self.transition(UploadStatus::DuplicatePending)?;
        self.bytes_uploaded = self.file_size;
        self.duplicate = Some(info);
        Ok(old)
    }

    pub fn mark_error(&mut self, error: String) -> Result<UploadStatus, InvalidTransition> {
        let old = self.transition(UploadStatus::Error)?;
        self.error = Some(error);
        Ok(old)
    }

    /// 手动重试：error -> queued，重置重试计数
    pub fn mark_requeued_after_error(&mut self) -> Result<UploadStatus, InvalidTransition> {
        let old = self.transition(UploadStatus::Queued)?;
        self.error = None;
        self.retry_count = 0;
        Ok(old)
    }
}

/// 提交前的文件预览
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFilePreview {
    pub local_path: PathBuf,
    pub file_name: String,
    pub relative_path: String,
    pub file_size: u64,
    /// 服务端已存在同路径视频（仅作提示）
    pub exists_on_server: bool,
    /// 是否提交上传，默认为 !exists_on_server
    pub selected: bool,
    /// 开始上传后对应的上传 ID
    #[serde(default)]
    pub upload_id: Option<String>,
    /// 开始上传后跟随 UploadMetadata.status
    #[serde(default)]
    pub status: Option<UploadStatus>,
}

impl VideoFilePreview {
    pub fn new(
        local_path: PathBuf,
        relative_path: String,
        file_size: u64,
        exists_on_server: bool,
    ) -> Self {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| relative_path.clone());
        Self {
            local_path,
            file_name,
            relative_path,
            file_size,
            exists_on_server,
            selected: !exists_on_server,
            upload_id: None,
            status: None,
        }
    }

    pub fn to_metadata(&self) -> UploadMetadata {
        UploadMetadata::new(
            self.local_path.clone(),
            self.relative_path.clone(),
            self.file_size,
        )
    }

    /// 跟随上传状态
    pub fn mirror(&mut self, meta: &UploadMetadata) {
        self.upload_id = Some(meta.id.clone());
        self.status = Some(meta.status);
    }
}
