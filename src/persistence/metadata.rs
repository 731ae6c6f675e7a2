//! 上传元数据文件读写

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::uploader::UploadMetadata;

/// 元数据文件扩展名
const META_EXTENSION: &str = "meta";

/// 持久化上传存储
///
/// `dir` 为 None 时所有操作都是空操作（关闭持久化或测试）
#[derive(Debug, Clone)]
pub struct PersistentUploadStore {
    dir: Option<PathBuf>,
}

impl PersistentUploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// 不落盘的存储
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn path_for(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{}.{}", id, META_EXTENSION))
    }

    /// 保存（先写临时文件再原子重命名）
    pub fn save(&self, meta: &UploadMetadata) -> io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;

        let path = Self::path_for(dir, &meta.id);
        let temp_path = path.with_extension("meta.tmp");

        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;
        debug!("已保存上传元数据: id={}, status={}", meta.id, meta.status);
        Ok(())
    }

    pub fn load(&self, id: &str) -> io::Result<Option<UploadMetadata>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = Self::path_for(dir, id);
        if !path.exists() {
            return Ok(None);
        }
        load_from_path(&path).map(Some)
    }

    /// 删除元数据，不存在时返回 Ok(false)
    pub fn remove(&self, id: &str) -> io::Result<bool> {
        let Some(dir) = &self.dir else {
            return Ok(false);
        };
        match fs::remove_file(Self::path_for(dir, id)) {
            Ok(()) => {
                debug!("已删除上传元数据: id={}", id);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 读取全部元数据，跳过无法解析的文件
    pub fn load_all(&self) -> io::Result<Vec<UploadMetadata>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut list = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map_or(true, |e| e != META_EXTENSION) {
                continue;
            }
            match load_from_path(&path) {
                Ok(meta) => list.push(meta),
                Err(e) => warn!("跳过无效元数据文件 {:?}: {}", path, e),
            }
        }

        list.sort_by_key(|m| m.created_at);
        Ok(list)
    }
}

fn load_from_path(path: &Path) -> io::Result<UploadMetadata> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
