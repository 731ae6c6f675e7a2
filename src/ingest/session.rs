//! 服务端上传会话
//!
//! 每个会话两个文件：`{id}.part`（已接收的字节）和 `{id}.json`（会话信息）。
//! 偏移量就是 part 文件的长度，服务重启后从磁盘重建。

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("上传会话不存在: {0}")]
    NotFound(String),
    #[error("偏移量不匹配: 请求 {requested}, 服务端 {actual}")]
    OffsetMismatch { requested: u64, actual: u64 },
    #[error("超出大小限制: {0}")]
    TooLarge(String),
    #[error("上传尚未完成: {offset}/{length}")]
    Incomplete { offset: u64, length: u64 },
    #[error("请求无效: {0}")]
    Invalid(String),
    #[error("存储失败: {0}")]
    Storage(#[from] io::Error),
}

impl SessionError {
    /// 磁盘空间不足
    pub fn is_storage_full(&self) -> bool {
        match self {
            // ENOSPC
            SessionError::Storage(e) => e.raw_os_error() == Some(28),
            _ => false,
        }
    }
}

/// 会话信息（`{id}.json`）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub file_name: String,
    pub relative_path: String,
    pub upload_length: u64,
    pub created_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

struct SessionSlot {
    info: SessionInfo,
    offset: u64,
}

/// 上传会话管理器
pub struct UploadSessionManager {
    dir: PathBuf,
    max_chunk_size: u64,
    max_upload_size: u64,
    sessions: DashMap<String, Arc<Mutex<SessionSlot>>>,
}

impl UploadSessionManager {
    /// 打开会话目录并重建已有会话
    pub async fn open(dir: PathBuf, max_chunk_size: u64, max_upload_size: u64) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let manager = Self {
            dir,
            max_chunk_size,
            max_upload_size,
            sessions: DashMap::new(),
        };
        let restored = manager.restore().await?;
        info!("上传会话目录: {:?}, 已恢复 {} 个会话", manager.dir, restored);
        Ok(manager)
    }

    fn part_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.part", id))
    }

    fn info_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn restore(&self) -> anyhow::Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut restored = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let info: SessionInfo = match tokio::fs::read(&path)
                .await
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(anyhow::Error::from))
            {
                Ok(info) => info,
                Err(e) => {
                    warn!("跳过损坏的会话文件: {:?}, 错误: {}", path, e);
                    continue;
                }
            };
            let offset = match tokio::fs::metadata(self.part_path(&info.id)).await {
                Ok(m) => m.len(),
                Err(_) => {
                    warn!("会话 {} 缺少数据文件，已丢弃", info.id);
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
            };
            self.sessions.insert(
                info.id.clone(),
                Arc::new(Mutex::new(SessionSlot { info, offset })),
            );
            restored += 1;
        }
        Ok(restored)
    }

    fn slot(&self, id: &str) -> Result<Arc<Mutex<SessionSlot>>, SessionError> {
        self.sessions
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// 创建会话
    pub async fn create(
        &self,
        upload_length: u64,
        metadata: HashMap<String, String>,
    ) -> Result<SessionInfo, SessionError> {
        if upload_length > self.max_upload_size {
            return Err(SessionError::TooLarge(format!(
                "文件大小 {} 超过上限 {}",
                upload_length, self.max_upload_size
            )));
        }
        let file_name = metadata
            .get("filename")
            .cloned()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SessionError::Invalid("缺少 filename".to_string()))?;
        let relative_path = metadata
            .get("relative_path")
            .cloned()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| file_name.clone());

        let info = SessionInfo {
            id: uuid::Uuid::new_v4().simple().to_string(),
            file_name,
            relative_path,
            upload_length,
            created_at: chrono::Utc::now().timestamp_millis(),
            metadata,
        };

        tokio::fs::File::create(self.part_path(&info.id)).await?;
        self.write_info(&info).await?;

        self.sessions.insert(
            info.id.clone(),
            Arc::new(Mutex::new(SessionSlot {
                info: info.clone(),
                offset: 0,
            })),
        );
        info!(
            "创建上传会话: {} {} ({} bytes)",
            info.id, info.relative_path, info.upload_length
        );
        Ok(info)
    }

    async fn write_info(&self, info: &SessionInfo) -> io::Result<()> {
        let path = self.info_path(&info.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(info)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    /// 当前偏移量和总长度
    pub async fn offset(&self, id: &str) -> Result<(u64, u64), SessionError> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        Ok((slot.offset, slot.info.upload_length))
    }

    pub async fn info(&self, id: &str) -> Result<SessionInfo, SessionError> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        Ok(slot.info.clone())
    }

    /// 在 `offset` 处追加数据，返回新偏移量
    ///
    /// 同一会话的追加串行执行；`offset` 必须等于服务端当前偏移量
    pub async fn append(&self, id: &str, offset: u64, data: &[u8]) -> Result<u64, SessionError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;

        if offset != slot.offset {
            return Err(SessionError::OffsetMismatch {
                requested: offset,
                actual: slot.offset,
            });
        }
        let len = data.len() as u64;
        if len > self.max_chunk_size {
            return Err(SessionError::TooLarge(format!(
                "分片大小 {} 超过上限 {}",
                len, self.max_chunk_size
            )));
        }
        if offset + len > slot.info.upload_length {
            return Err(SessionError::TooLarge(format!(
                "写入后偏移量 {} 超过文件大小 {}",
                offset + len,
                slot.info.upload_length
            )));
        }

        let path = self.part_path(id);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await?;
            file.write_all(data).await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = result {
            // 回滚到写入前的长度，保证偏移量与文件一致
            if let Ok(file) = tokio::fs::OpenOptions::new().write(true).open(&path).await {
                let _ = file.set_len(slot.offset).await;
            }
            return Err(SessionError::Storage(e));
        }

        slot.offset += len;
        debug!("会话 {} 追加 {} bytes, 偏移量 {}", id, len, slot.offset);
        Ok(slot.offset)
    }

    /// 已接收全部字节的会话，返回会话信息和数据文件路径
    pub async fn completed(&self, id: &str) -> Result<(SessionInfo, PathBuf), SessionError> {
        let slot = self.slot(id)?;
        let slot = slot.lock().await;
        if slot.offset != slot.info.upload_length {
            return Err(SessionError::Incomplete {
                offset: slot.offset,
                length: slot.info.upload_length,
            });
        }
        Ok((slot.info.clone(), self.part_path(id)))
    }

    /// 删除会话及其文件，返回会话是否存在
    pub async fn remove(&self, id: &str) -> Result<bool, SessionError> {
        let Some((_, slot)) = self.sessions.remove(id) else {
            return Ok(false);
        };
        // 等待进行中的追加结束
        let _slot = slot.lock().await;
        remove_if_exists(&self.part_path(id)).await?;
        remove_if_exists(&self.info_path(id)).await?;
        info!("上传会话已删除: {}", id);
        Ok(true)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// 解析 `Upload-Metadata` 头：逗号分隔的 `key base64(value)`
pub fn parse_upload_metadata(header: &str) -> Result<HashMap<String, String>, SessionError> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let mut map = HashMap::new();
    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().unwrap_or_default().to_string();
        let value = match parts.next() {
            Some(encoded) => {
                let raw = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| SessionError::Invalid(format!("元数据 {} 解码失败: {}", key, e)))?;
                String::from_utf8(raw)
                    .map_err(|_| SessionError::Invalid(format!("元数据 {} 不是 UTF-8", key)))?
            }
            None => String::new(),
        };
        map.insert(key, value);
    }
    Ok(map)
}
