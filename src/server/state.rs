// 应用状态

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::{AppConfig, SlotCounterBackend};
use crate::ingest::{IngestService, UploadSessionManager, VideoRepository, VideoStorage};
use crate::processing::{
    CommandPipelineExecutor, MemorySlotCounter, PipelineExecutor, ProcessingAdmissionController,
    ProcessingQueue, SlotCounter, SqliteSlotCounter,
};

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置（启动后只读）
    pub config: Arc<AppConfig>,
    /// 上传会话与入库
    pub ingest: Arc<IngestService>,
    /// 后台处理队列
    pub processing: ProcessingQueue,
}

impl AppState {
    /// 按配置创建应用状态，处理任务使用配置中的外部命令
    pub async fn new(config: AppConfig) -> Result<Self> {
        let executor = Arc::new(CommandPipelineExecutor::new(
            config.processing.pipelines.clone(),
        ));
        Self::with_executor(config, executor).await
    }

    /// 使用指定的流水线执行器创建应用状态
    pub async fn with_executor(
        config: AppConfig,
        executor: Arc<dyn PipelineExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let repository = Arc::new(VideoRepository::open(&config.storage.database_path)?);

        let sessions = Arc::new(
            UploadSessionManager::open(
                config.storage.sessions_dir(),
                config.storage.max_chunk_size,
                config.storage.max_upload_size,
            )
            .await?,
        );
        info!("上传会话已加载: {} 个", sessions.len());

        let instance_id = config.processing.resolve_instance_id();
        info!("服务实例: {}", instance_id);
        let counter: Arc<dyn SlotCounter> = match config.processing.counter {
            SlotCounterBackend::Memory => Arc::new(MemorySlotCounter::new()),
            SlotCounterBackend::Sqlite => Arc::new(SqliteSlotCounter::open(
                &config.storage.database_path,
                &instance_id,
            )?),
        };
        let admission = ProcessingAdmissionController::new(
            config.processing.max_total_concurrent_processing,
            counter,
            Duration::from_millis(config.processing.counter_poll_ms.max(1)),
        );

        let processing = ProcessingQueue::new(
            Arc::clone(&repository),
            admission,
            executor,
            config.storage.videos_dir(),
            config.processing.job_timeout(),
            config.processing.default_pipeline,
            instance_id,
        );
        let interrupted = processing.recover_interrupted()?;
        if interrupted > 0 {
            warn!("{} 个处理任务在上次运行中被中断，已标记为失败", interrupted);
        }

        let ingest = Arc::new(IngestService::new(
            sessions,
            repository,
            VideoStorage::new(config.storage.videos_dir()),
            processing.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            ingest,
            processing,
        })
    }

    /// 停止接收处理任务并中止运行中的任务
    pub fn shutdown(&self) {
        self.processing.shutdown();
        info!("应用状态已关闭");
    }
}
