// 后台处理模块
//
// - 全局准入控制：所有流水线共享同一个并发上限
// - 槽位计数器：进程内（原子计数）或 SQLite（多实例共享）
// - 处理队列：每个任务一个监督任务，超时看门狗强制释放槽位
// - 流水线执行器：外部命令

pub mod admission;
pub mod counter;
pub mod pipeline;
pub mod queue;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use admission::{
    AdmissionError, AdmissionPermit, AdmissionSnapshot, AdmissionTicket,
    ProcessingAdmissionController,
};
pub use counter::{MemorySlotCounter, SlotCounter, SqliteSlotCounter};
pub use pipeline::{CommandPipelineExecutor, PipelineExecutor, PipelineJob};
pub use queue::{ProcessingQueue, QueueError};

/// 流水线类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// 抽帧 + OCR + 版面分析
    #[default]
    FrameExtraction,
    /// 裁剪
    Cropping,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::FrameExtraction => "frame_extraction",
            PipelineKind::Cropping => "cropping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "frame_extraction" => Some(PipelineKind::FrameExtraction),
            "cropping" => Some(PipelineKind::Cropping),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
