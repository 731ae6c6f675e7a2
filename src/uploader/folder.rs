//! 拖放目录收集
//!
//! 拖放事件的条目列表只在事件处理期间有效，所以分两步：
//! 1. `DirectoryCollector::snapshot` 同步取出所有条目（不解析、不 await）
//! 2. `DropSnapshot::collect` 异步遍历目录，得到扁平的文件列表
//!
//! 单个目录读取失败只记录日志并跳过，不影响其他条目。

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 拖放条目（文件或目录）
#[async_trait]
pub trait DropEntry: Send + Sync {
    fn is_file(&self) -> bool;
    fn is_directory(&self) -> bool;
    fn name(&self) -> String;

    /// 目录子项读取器，每次 `next_batch` 返回一批，空批次表示读完
    fn children(&self) -> Box<dyn DirectoryReader>;

    /// 把文件条目解析为具体的本地文件
    async fn resolve_file(&self) -> Result<ResolvedFile>;
}

/// 目录子项读取器
#[async_trait]
pub trait DirectoryReader: Send {
    async fn next_batch(&mut self) -> Result<Vec<Arc<dyn DropEntry>>>;
}

/// 拖放列表中的原始项
pub trait DropItem {
    /// 取出条目；不能表示为文件或目录的项返回 None
    fn as_entry(&self) -> Option<Arc<dyn DropEntry>>;
}

/// 解析后的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub local_path: PathBuf,
    pub size: u64,
}

/// 收集到的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    pub local_path: PathBuf,
    /// 以拖入条目为根的相对路径（`/` 分隔）
    pub relative_path: String,
    pub size: u64,
}

/// 被跳过的条目
#[derive(Debug, Clone)]
pub struct CollectFailure {
    pub relative_path: String,
    pub error: String,
}

/// 收集结果
#[derive(Debug, Default)]
pub struct CollectReport {
    pub files: Vec<CollectedFile>,
    pub failures: Vec<CollectFailure>,
}

/// 收集选项
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// 跳过以 `.` 开头的文件和目录
    pub skip_hidden: bool,
    /// 只保留这些扩展名（小写，不含点），None 表示不过滤
    pub extensions: Option<Vec<String>>,
}

/// 常见视频扩展名
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "mkv", "avi", "webm", "mts", "m2ts"];

/// 目录收集器
#[derive(Debug, Clone, Default)]
pub struct DirectoryCollector {
    options: CollectOptions,
}

impl DirectoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: CollectOptions) -> Self {
        Self { options }
    }

    /// 只收集视频文件，跳过隐藏文件
    pub fn videos_only() -> Self {
        Self::with_options(CollectOptions {
            skip_hidden: true,
            extensions: Some(VIDEO_EXTENSIONS.iter().map(|e| e.to_string()).collect()),
        })
    }

    /// 同步取出全部条目
    pub fn snapshot<I: DropItem>(&self, items: &[I]) -> DropSnapshot {
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            match item.as_entry() {
                Some(entry) => entries.push(entry),
                None => debug!("忽略无法识别的拖放项"),
            }
        }
        DropSnapshot {
            entries,
            options: self.options.clone(),
        }
    }
}

/// 已取出的条目，可以跨 await 持有
pub struct DropSnapshot {
    entries: Vec<Arc<dyn DropEntry>>,
    options: CollectOptions,
}

impl DropSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 遍历所有条目
    pub async fn collect(self) -> CollectReport {
        let DropSnapshot { entries, options } = self;
        let mut report = CollectReport::default();
        let mut stack: Vec<(Arc<dyn DropEntry>, String)> = entries
            .into_iter()
            .rev()
            .map(|e| {
                let name = e.name();
                (e, name)
            })
            .collect();

        while let Some((entry, relative_path)) = stack.pop() {
            if options.skip_hidden && entry.name().starts_with('.') {
                debug!("跳过隐藏条目: {}", relative_path);
                continue;
            }

            if entry.is_directory() {
                let mut reader = entry.children();
                loop {
                    let batch = match reader.next_batch().await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!("读取目录失败，已跳过: {}, 错误: {:#}", relative_path, e);
                            report.failures.push(CollectFailure {
                                relative_path: relative_path.clone(),
                                error: format!("{:#}", e),
                            });
                            break;
                        }
                    };
                    if batch.is_empty() {
                        break;
                    }
                    for child in batch {
                        let child_path = format!("{}/{}", relative_path, child.name());
                        stack.push((child, child_path));
                    }
                }
            } else if entry.is_file() {
                if !extension_allowed(&options, &entry.name()) {
                    debug!("跳过非视频文件: {}", relative_path);
                    continue;
                }
                match entry.resolve_file().await {
                    Ok(file) => report.files.push(CollectedFile {
                        local_path: file.local_path,
                        relative_path,
                        size: file.size,
                    }),
                    Err(e) => {
                        warn!("读取文件失败，已跳过: {}, 错误: {:#}", relative_path, e);
                        report.failures.push(CollectFailure {
                            relative_path,
                            error: format!("{:#}", e),
                        });
                    }
                }
            }
        }

        info!(
            "拖放收集完成: {} 个文件, {} 个条目失败",
            report.files.len(),
            report.failures.len()
        );
        report
    }
}

fn extension_allowed(options: &CollectOptions, name: &str) -> bool {
    let Some(allowed) = &options.extensions else {
        return true;
    };
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .map(|e| allowed.iter().any(|a| a == &e))
        .unwrap_or(false)
}

// =====================================================
// 本地文件系统适配
// =====================================================

/// 每批读取的目录项数量
const FS_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsKind {
    File,
    Directory,
    Other,
}

/// 本地文件系统条目
#[derive(Debug, Clone)]
pub struct FsEntry {
    path: PathBuf,
    kind: FsKind,
}

impl FsEntry {
    /// 同步读取元数据（不跟随符号链接）
    pub fn new(path: PathBuf) -> Self {
        let kind = match std::fs::symlink_metadata(&path) {
            Ok(m) if m.is_dir() => FsKind::Directory,
            Ok(m) if m.is_file() => FsKind::File,
            _ => FsKind::Other,
        };
        Self { path, kind }
    }
}

#[async_trait]
impl DropEntry for FsEntry {
    fn is_file(&self) -> bool {
        self.kind == FsKind::File
    }

    fn is_directory(&self) -> bool {
        self.kind == FsKind::Directory
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.to_string_lossy().to_string())
    }

    fn children(&self) -> Box<dyn DirectoryReader> {
        Box::new(FsDirectoryReader {
            path: self.path.clone(),
            read_dir: None,
            done: false,
        })
    }

    async fn resolve_file(&self) -> Result<ResolvedFile> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("读取文件元数据失败: {}", self.path.display()))?;
        Ok(ResolvedFile {
            local_path: self.path.clone(),
            size: meta.len(),
        })
    }
}

struct FsDirectoryReader {
    path: PathBuf,
    read_dir: Option<tokio::fs::ReadDir>,
    done: bool,
}

#[async_trait]
impl DirectoryReader for FsDirectoryReader {
    async fn next_batch(&mut self) -> Result<Vec<Arc<dyn DropEntry>>> {
        if self.done {
            return Ok(Vec::new());
        }
        if self.read_dir.is_none() {
            let rd = tokio::fs::read_dir(&self.path)
                .await
                .with_context(|| format!("读取目录失败: {}", self.path.display()))?;
            self.read_dir = Some(rd);
        }
        let Some(read_dir) = self.read_dir.as_mut() else {
            return Ok(Vec::new());
        };

        let mut batch: Vec<Arc<dyn DropEntry>> = Vec::new();
        while batch.len() < FS_BATCH_SIZE {
            match read_dir
                .next_entry()
                .await
                .with_context(|| format!("读取目录条目失败: {}", self.path.display()))?
            {
                Some(entry) => batch.push(Arc::new(FsEntry::new(entry.path()))),
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        Ok(batch)
    }
}

impl DropItem for PathBuf {
    fn as_entry(&self) -> Option<Arc<dyn DropEntry>> {
        let entry = FsEntry::new(self.clone());
        if entry.kind == FsKind::Other {
            return None;
        }
        Some(Arc::new(entry))
    }
}
