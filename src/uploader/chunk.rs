// 上传分片规划与读取
//
// 断点续传协议下分片按偏移量顺序发送，每次从服务端确认的偏移量开始读取下一片

use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 默认分片大小: 8MB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// 最小分片大小: 64KB
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;

/// 最大分片大小: 64MB（与服务端单次 PATCH 上限一致）
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// 分片规划
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// 分片大小被限制在 [MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self {
            file_size,
            chunk_size: chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 从 `offset` 开始的下一片字节范围，已到文件末尾时返回 None
    pub fn next_range(&self, offset: u64) -> Option<Range<u64>> {
        if offset >= self.file_size {
            return None;
        }
        let end = offset.saturating_add(self.chunk_size).min(self.file_size);
        Some(offset..end)
    }

    /// 剩余分片数
    pub fn remaining_chunks(&self, offset: u64) -> u64 {
        self.file_size.saturating_sub(offset).div_ceil(self.chunk_size)
    }
}

/// 读取文件的一段字节
///
/// 在阻塞线程池执行，避免大分片读取阻塞调度线程
pub async fn read_range(path: &Path, range: Range<u64>) -> Result<Vec<u8>> {
    let path: PathBuf = path.to_path_buf();
    let len = (range.end - range.start) as usize;

    let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("打开上传文件失败: {:?}", path))?;
        file.seek(SeekFrom::Start(range.start))
            .context("文件定位失败")?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).context("读取分片数据失败")?;
        Ok(buffer)
    })
    .await
    .context("分片读取任务异常退出")??;

    debug!("读取分片: bytes={}-{}, 大小={} bytes", range.start, range.end, len);
    Ok(data)
}
