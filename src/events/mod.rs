//! 调度器事件
//!
//! 调度器通过 mpsc 通道向调用方推送事件，调用方（CLI、界面）据此刷新显示

pub mod throttle;
pub mod types;

pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
pub use types::UploadEvent;
