// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::processing::PipelineKind;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 上传配置（上传代理使用）
    #[serde(default)]
    pub upload: UploadConfig,
    /// 处理任务配置
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// 服务端存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 上传状态持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18090,
        }
    }
}

/// 上传配置
///
/// 对应客户端调度器的全部可调参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 上传服务地址（不含 /api/v1 后缀）
    #[serde(default = "default_upload_endpoint")]
    pub endpoint: String,
    /// 同时处于 uploading 的最大上传数
    #[serde(default = "default_concurrent_uploads")]
    pub concurrent_uploads: usize,
    /// 重试等待表（毫秒），超出长度时取最后一项
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 停滞超时（毫秒）
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// 停滞检测间隔（毫秒）
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 启动时是否自动恢复上次未完成的上传（否则以暂停状态恢复）
    #[serde(default)]
    pub auto_resume: bool,
    /// 单次 HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_upload_endpoint() -> String {
    "http://127.0.0.1:18090".to_string()
}

fn default_concurrent_uploads() -> usize {
    3
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![0, 3000, 5000, 10000, 20000, 60000]
}

fn default_max_retries() -> u32 {
    2
}

fn default_stall_timeout_ms() -> u64 {
    60_000
}

fn default_stall_check_interval_ms() -> u64 {
    1_000
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_upload_endpoint(),
            concurrent_uploads: default_concurrent_uploads(),
            retry_delays_ms: default_retry_delays_ms(),
            max_retries: default_max_retries(),
            stall_timeout_ms: default_stall_timeout_ms(),
            stall_check_interval_ms: default_stall_check_interval_ms(),
            chunk_size: default_chunk_size(),
            auto_resume: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl UploadConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_millis(self.stall_check_interval_ms.max(1))
    }
}

/// 槽位计数器后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotCounterBackend {
    /// 单进程内存计数器
    Memory,
    /// SQLite 共享计数器（多进程共享同一数据库文件）
    Sqlite,
}

/// 单个处理流水线的外部命令
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCommand {
    /// 可执行程序
    pub program: String,
    /// 额外参数（视频目录和 JSON 参数追加在末尾）
    #[serde(default)]
    pub args: Vec<String>,
}

/// 处理任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// 全局最大并发处理任务数（所有流水线共享）
    #[serde(default = "default_max_total_concurrent_processing")]
    pub max_total_concurrent_processing: usize,
    /// 单个任务最长运行时间（秒），超时由看门狗强制释放槽位
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// 槽位计数器后端
    #[serde(default = "default_slot_counter")]
    pub counter: SlotCounterBackend,
    /// 实例 ID，共享数据库的每个服务进程必须不同且重启后不变
    ///
    /// SQLite 计数器按它清理本实例遗留的槽位，启动恢复只处理本实例的任务。
    /// 未配置时每个进程生成一个临时 ID，只适用于内存计数器。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// SQLite 计数器轮询间隔（毫秒）
    #[serde(default = "default_counter_poll_ms")]
    pub counter_poll_ms: u64,
    /// 上传完成后自动入队的流水线
    #[serde(default = "default_pipeline")]
    pub default_pipeline: PipelineKind,
    /// 各流水线的外部命令
    #[serde(default)]
    pub pipelines: HashMap<PipelineKind, PipelineCommand>,
}

fn default_max_total_concurrent_processing() -> usize {
    2
}

fn default_job_timeout_secs() -> u64 {
    4 * 60 * 60
}

fn default_slot_counter() -> SlotCounterBackend {
    SlotCounterBackend::Memory
}

fn default_counter_poll_ms() -> u64 {
    500
}

fn default_pipeline() -> PipelineKind {
    PipelineKind::FrameExtraction
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_total_concurrent_processing: default_max_total_concurrent_processing(),
            job_timeout_secs: default_job_timeout_secs(),
            counter: default_slot_counter(),
            instance_id: None,
            counter_poll_ms: default_counter_poll_ms(),
            default_pipeline: default_pipeline(),
            pipelines: HashMap::new(),
        }
    }
}

impl ProcessingConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// 配置的实例 ID；未配置时生成进程唯一的临时 ID
    pub fn resolve_instance_id(&self) -> String {
        match self.instance_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!(
                "ingest-{}-{}",
                std::process::id(),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
        }
    }
}

/// 服务端存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据根目录（sessions/ 与 videos/ 位于其下）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// SQLite 数据库路径
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// 单个 PATCH 请求最大字节数
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// 单个文件最大字节数
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/videos.db")
}

fn default_max_chunk_size() -> u64 {
    64 * 1024 * 1024
}

fn default_max_upload_size() -> u64 {
    50 * 1024 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: default_database_path(),
            max_chunk_size: default_max_chunk_size(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

impl StorageConfig {
    /// 上传会话目录
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// 视频存储目录
    pub fn videos_dir(&self) -> PathBuf {
        self.data_dir.join("videos")
    }
}

/// 上传状态持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 上传元数据存储目录
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// 是否启用持久化
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("upload_state")
}

fn default_persistence_enabled() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            enabled: default_persistence_enabled(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置，然后应用环境变量覆盖
    pub async fn load_or_default(path: &str) -> Self {
        let mut config = match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// 应用环境变量覆盖
    ///
    /// 支持 CONCURRENT_UPLOADS / RETRY_DELAYS / MAX_RETRIES / STALL_TIMEOUT /
    /// MAX_TOTAL_CONCURRENT_PROCESSING / INSTANCE_ID，解析失败的值被忽略
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CONCURRENT_UPLOADS").and_then(|v| v.trim().parse().ok()) {
            self.upload.concurrent_uploads = v;
        }
        if let Some(v) = lookup("RETRY_DELAYS") {
            let delays: std::result::Result<Vec<u64>, _> =
                v.split(',').map(|s| s.trim().parse::<u64>()).collect();
            match delays {
                Ok(delays) if !delays.is_empty() => self.upload.retry_delays_ms = delays,
                _ => tracing::warn!("忽略无效的 RETRY_DELAYS: {}", v),
            }
        }
        if let Some(v) = lookup("MAX_RETRIES").and_then(|v| v.trim().parse().ok()) {
            self.upload.max_retries = v;
        }
        if let Some(v) = lookup("STALL_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.upload.stall_timeout_ms = v;
        }
        if let Some(v) =
            lookup("MAX_TOTAL_CONCURRENT_PROCESSING").and_then(|v| v.trim().parse().ok())
        {
            self.processing.max_total_concurrent_processing = v;
        }
        if let Some(v) = lookup("INSTANCE_ID").filter(|v| !v.trim().is_empty()) {
            self.processing.instance_id = Some(v.trim().to_string());
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.upload.concurrent_uploads == 0 {
            anyhow::bail!("upload.concurrent_uploads 必须大于 0");
        }
        if self.upload.retry_delays_ms.is_empty() {
            anyhow::bail!("upload.retry_delays_ms 不能为空");
        }
        if self.processing.max_total_concurrent_processing == 0 {
            anyhow::bail!("processing.max_total_concurrent_processing 必须大于 0");
        }
        if self.processing.counter == SlotCounterBackend::Sqlite
            && self
                .processing
                .instance_id
                .as_deref()
                .map_or(true, |id| id.trim().is_empty())
        {
            anyhow::bail!("processing.counter = \"sqlite\" 时必须为每个实例配置不同的 processing.instance_id");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_tunables() {
        let config = AppConfig::default();
        assert_eq!(config.upload.concurrent_uploads, 3);
        assert_eq!(
            config.upload.retry_delays_ms,
            vec![0, 3000, 5000, 10000, 20000, 60000]
        );
        assert_eq!(config.upload.max_retries, 2);
        assert_eq!(config.upload.stall_timeout_ms, 60_000);
        assert_eq!(config.processing.max_total_concurrent_processing, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CONCURRENT_UPLOADS", "5"),
            ("RETRY_DELAYS", "0, 100,200"),
            ("MAX_RETRIES", "4"),
            ("STALL_TIMEOUT", "1500"),
            ("MAX_TOTAL_CONCURRENT_PROCESSING", "1"),
            ("INSTANCE_ID", "ingest-b"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.upload.concurrent_uploads, 5);
        assert_eq!(config.upload.retry_delays_ms, vec![0, 100, 200]);
        assert_eq!(config.upload.max_retries, 4);
        assert_eq!(config.upload.stall_timeout_ms, 1500);
        assert_eq!(config.processing.max_total_concurrent_processing, 1);
        assert_eq!(config.processing.instance_id.as_deref(), Some("ingest-b"));
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = AppConfig::default();
        config.apply_env_overrides(|k| match k {
            "RETRY_DELAYS" => Some("1,abc".to_string()),
            "CONCURRENT_UPLOADS" => Some("many".to_string()),
            _ => None,
        });
        assert_eq!(config.upload.concurrent_uploads, 3);
        assert_eq!(config.upload.retry_delays_ms.len(), 6);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [upload]
            concurrent_uploads = 4

            [processing]
            max_total_concurrent_processing = 3
            counter = "sqlite"

            [processing.pipelines.cropping]
            program = "crop-tool"
            args = ["--fast"]
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.upload.concurrent_uploads, 4);
        assert_eq!(config.upload.max_retries, 2);
        assert_eq!(config.processing.max_total_concurrent_processing, 3);
        assert_eq!(config.processing.counter, SlotCounterBackend::Sqlite);
        let crop = config
            .processing
            .pipelines
            .get(&PipelineKind::Cropping)
            .unwrap();
        assert_eq!(crop.program, "crop-tool");
        assert_eq!(config.server.port, 18090);
    }

    #[test]
    fn test_sqlite_counter_requires_instance_id() {
        let mut config = AppConfig::default();
        config.processing.counter = SlotCounterBackend::Sqlite;
        assert!(config.validate().is_err());

        config.processing.instance_id = Some("  ".to_string());
        assert!(config.validate().is_err());

        config.processing.instance_id = Some("ingest-a".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.processing.resolve_instance_id(), "ingest-a");
    }

    #[test]
    fn test_generated_instance_ids_differ() {
        let a = ProcessingConfig::default();
        let b = ProcessingConfig::default();
        assert!(a.instance_id.is_none());
        assert_ne!(a.resolve_instance_id(), b.resolve_instance_id());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let mut config = AppConfig::default();
        config.upload.concurrent_uploads = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.max_total_concurrent_processing = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.chunk_size = 1024 * 1024;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.chunk_size, 1024 * 1024);
    }
}
