// 上传模块
//
// - 拖入文件夹的递归收集
// - 分片切分与本地读取
// - 断点续传传输层（HTTP 实现 + trait）
// - 全局上传调度器：并发上限、FIFO、停滞检测、重试

pub mod chunk;
pub mod folder;
pub mod retry;
pub mod scheduler;
pub mod stall;
pub mod task;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{ChunkPlan, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use folder::{
    CollectFailure, CollectOptions, CollectReport, CollectedFile, DirectoryCollector, DropEntry,
    DropItem, DropSnapshot, FsEntry, VIDEO_EXTENSIONS,
};
pub use retry::{RetryController, RetryDecision, UploadErrorKind};
pub use scheduler::{AggregateStatus, SchedulerConfig, SchedulerError, UploadScheduler};
pub use stall::StallMonitor;
pub use task::{DuplicateInfo, InvalidTransition, UploadMetadata, UploadStatus, VideoFilePreview};
pub use transport::{HttpResumableTransport, ResumableTransport, TransportError};
