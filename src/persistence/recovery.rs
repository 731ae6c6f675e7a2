//! 启动恢复
//!
//! 1. 读取全部上传元数据
//! 2. 清理已完成或已取消的记录
//! 3. 校验本地文件（存在且大小未变）
//! 4. 把中断时的运行态归一为 paused（或 auto_resume 时为 queued）

use std::io;
use tracing::{info, warn};

use super::metadata::PersistentUploadStore;
use crate::uploader::{UploadMetadata, UploadStatus};

/// 恢复扫描结果
#[derive(Debug, Default)]
pub struct RecoveryScanResult {
    /// 可恢复的上传（已归一化状态）
    pub recoverable: Vec<UploadMetadata>,
    /// 已结束的记录（已清理）
    pub finished: Vec<String>,
    /// 校验失败的记录（已清理）
    pub invalid: Vec<(String, String)>,
}

impl RecoveryScanResult {
    pub fn has_recoverable(&self) -> bool {
        !self.recoverable.is_empty()
    }
}

/// 扫描并校验可恢复的上传
pub fn scan_recoverable_uploads(
    store: &PersistentUploadStore,
    auto_resume: bool,
) -> io::Result<RecoveryScanResult> {
    let mut result = RecoveryScanResult::default();

    for meta in store.load_all()? {
        if matches!(meta.status, UploadStatus::Complete | UploadStatus::Cancelled) {
            result.finished.push(meta.id.clone());
            store.remove(&meta.id)?;
            continue;
        }

        if let Err(reason) = validate_local_file(&meta) {
            warn!("上传 {} ({}) 无法恢复: {}", meta.id, meta.relative_path, reason);
            store.remove(&meta.id)?;
            result.invalid.push((meta.id, reason));
            continue;
        }

        result.recoverable.push(prepare_for_restore(meta, auto_resume));
    }

    if result.has_recoverable() || !result.invalid.is_empty() {
        info!(
            "上传恢复扫描完成: 可恢复 {} 个, 已结束 {} 个, 无效 {} 个",
            result.recoverable.len(),
            result.finished.len(),
            result.invalid.len()
        );
    }

    Ok(result)
}

fn validate_local_file(meta: &UploadMetadata) -> Result<(), String> {
    let local = std::fs::metadata(&meta.local_path)
        .map_err(|e| format!("本地文件不可用: {:?}: {}", meta.local_path, e))?;
    if !local.is_file() {
        return Err(format!("本地路径不是文件: {:?}", meta.local_path));
    }
    if local.len() != meta.file_size {
        return Err(format!(
            "本地文件大小已变化: 记录 {} 字节, 实际 {} 字节",
            meta.file_size,
            local.len()
        ));
    }
    Ok(())
}

/// 归一化中断前的状态
///
/// 进程退出时不存在运行中的传输，所以 uploading / stalled / retrying / queued / pending
/// 都回到 paused（auto_resume 时为 queued）。error 与 duplicate_pending 原样保留。
pub fn prepare_for_restore(mut meta: UploadMetadata, auto_resume: bool) -> UploadMetadata {
    let resumable = matches!(
        meta.status,
        UploadStatus::Pending
            | UploadStatus::Queued
            | UploadStatus::Uploading
            | UploadStatus::Stalled
            | UploadStatus::Retrying
            | UploadStatus::Paused
    );
    if resumable {
        meta.status = if auto_resume {
            UploadStatus::Queued
        } else {
            UploadStatus::Paused
        };
    }
    meta.bytes_uploaded = meta.bytes_uploaded.min(meta.file_size);
    meta
}
