// Video Ingest Rust Library
// 视频上传、入库与处理调度核心库

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 上传事件
pub mod events;

// 客户端与服务端共用的协议类型
pub mod protocol;

// 上传调度模块（客户端）
pub mod uploader;

// 上传状态持久化（客户端）
pub mod persistence;

// 会话、入库与重复内容决定（服务端）
pub mod ingest;

// 处理任务准入与队列（服务端）
pub mod processing;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use events::UploadEvent;
pub use ingest::{IngestService, VideoRecord, VideoRepository};
pub use processing::{PipelineKind, ProcessingAdmissionController, ProcessingQueue};
pub use protocol::{DuplicateDecision, FinalizeOutcome};
pub use server::AppState;
pub use uploader::{
    HttpResumableTransport, ResumableTransport, UploadMetadata, UploadScheduler, UploadStatus,
};
