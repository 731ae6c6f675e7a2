//! 上传状态持久化
//!
//! 每个未完成的上传保存为一个 JSON 文件，重启后据此恢复断点续传：
//!
//! ```text
//! upload_state/
//! └── {upload_id}.meta    # UploadMetadata（JSON）
//! ```
//!
//! 恢复时缓存的偏移量只作参考，续传前总是以服务端 HEAD 返回的偏移量为准。

pub mod metadata;
pub mod recovery;

pub use metadata::PersistentUploadStore;
pub use recovery::{prepare_for_restore, scan_recoverable_uploads, RecoveryScanResult};
