//! 进度事件节流器
//!
//! 每个上传一个节流器，限制 Progress 事件的发布频率

use std::time::Duration;
use tokio::time::Instant;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 由调度器在持有状态锁时调用，因此不需要原子操作。
/// 使用 tokio 的 Instant，测试中可以用暂停时钟驱动。
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距上次发布超过间隔时返回 true 并记录本次时间
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// 强制发布（完成、暂停等最后一次更新）
    pub fn force_emit(&mut self, now: Instant) {
        self.last_emit = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
