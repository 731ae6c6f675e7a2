// 视频文件存储：videos/{video_id}/{file_name}

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct VideoStorage {
    videos_dir: PathBuf,
}

impl VideoStorage {
    pub fn new(videos_dir: PathBuf) -> Self {
        Self { videos_dir }
    }

    pub fn videos_dir(&self) -> &Path {
        &self.videos_dir
    }

    pub fn video_dir(&self, video_id: &str) -> PathBuf {
        self.videos_dir.join(video_id)
    }

    /// 把已完成的上传文件移入视频目录，返回最终路径
    pub async fn commit(&self, part_path: &Path, video_id: &str, file_name: &str) -> Result<PathBuf> {
        let dir = self.video_dir(video_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("创建视频目录失败: {:?}", dir))?;

        // 只取文件名部分，不允许路径穿越
        let name = Path::new(file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "video".into());
        let target = dir.join(name);
        tokio::fs::rename(part_path, &target)
            .await
            .with_context(|| format!("移动上传文件失败: {:?} -> {:?}", part_path, target))?;
        Ok(target)
    }

    /// 递归删除视频目录（不可恢复），返回目录是否存在
    pub async fn remove_video_dir(&self, video_id: &str) -> Result<bool> {
        let dir = self.video_dir(video_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("已删除视频目录: {:?}", dir);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("删除视频目录失败: {:?}", dir)),
        }
    }
}

/// 计算文件 SHA-256（十六进制），在阻塞线程池执行
pub async fn hash_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("打开文件失败: {:?}", path))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buffer).context("读取文件失败")?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await?
}
