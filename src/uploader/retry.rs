// 重试决策

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 上传错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器 5xx（可重试）
    Server,
    /// 停滞超时（可重试）
    Stalled,
    /// 偏移量冲突，只需重新查询偏移量，不计入重试次数
    OffsetConflict,
    /// 会话过期或不存在（不可重试）
    SessionExpired,
    /// 磁盘或配额不足（不可重试）
    QuotaExceeded,
    /// 超出大小限制（不可重试）
    PayloadTooLarge,
    /// 其他 4xx（不可重试）
    Rejected,
    /// 本地文件读取失败（不可重试）
    LocalIo,
}

impl UploadErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadErrorKind::Network
                | UploadErrorKind::Timeout
                | UploadErrorKind::Server
                | UploadErrorKind::Stalled
        )
    }
}

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待后重试
    RetryAfter(Duration),
    /// 重新查询偏移量后立即继续
    Resync,
    /// 放弃，进入 error
    GiveUp,
}

/// 重试控制器
///
/// 纯函数：只看已重试次数和错误类型
#[derive(Debug, Clone)]
pub struct RetryController {
    delays: Vec<Duration>,
    max_retries: u32,
}

impl RetryController {
    pub fn new(delays_ms: &[u64], max_retries: u32) -> Self {
        let mut delays: Vec<Duration> = delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect();
        if delays.is_empty() {
            delays.push(Duration::ZERO);
        }
        Self { delays, max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 第 `attempt` 次重试的等待时间，超出表长时取最后一项
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn decide(&self, retry_count: u32, kind: UploadErrorKind) -> RetryDecision {
        if kind == UploadErrorKind::OffsetConflict {
            return RetryDecision::Resync;
        }
        if !kind.is_retriable() || retry_count >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(retry_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller() -> RetryController {
        RetryController::new(&[0, 3000, 5000, 10000, 20000, 60000], 2)
    }

    #[test]
    fn test_retry_table() {
        let c = controller();
        assert_eq!(
            c.decide(0, UploadErrorKind::Network),
            RetryDecision::RetryAfter(Duration::ZERO)
        );
        assert_eq!(
            c.decide(1, UploadErrorKind::Stalled),
            RetryDecision::RetryAfter(Duration::from_millis(3000))
        );
        assert_eq!(c.decide(2, UploadErrorKind::Timeout), RetryDecision::GiveUp);
    }

    #[test]
    fn test_fatal_errors_give_up_immediately() {
        let c = controller();
        for kind in [
            UploadErrorKind::SessionExpired,
            UploadErrorKind::QuotaExceeded,
            UploadErrorKind::PayloadTooLarge,
            UploadErrorKind::Rejected,
            UploadErrorKind::LocalIo,
        ] {
            assert_eq!(c.decide(0, kind), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_offset_conflict_is_not_a_failure() {
        let c = controller();
        assert_eq!(c.decide(99, UploadErrorKind::OffsetConflict), RetryDecision::Resync);
    }

    #[test]
    fn test_delay_clamps_to_last_entry() {
        let c = RetryController::new(&[0, 3000, 5000, 10000, 20000, 60000], 10);
        assert_eq!(c.delay_for(5), Duration::from_millis(60000));
        assert_eq!(c.delay_for(9), Duration::from_millis(60000));
        assert_eq!(
            c.decide(8, UploadErrorKind::Server),
            RetryDecision::RetryAfter(Duration::from_millis(60000))
        );
    }

    #[test]
    fn test_empty_table_means_immediate_retry() {
        let c = RetryController::new(&[], 1);
        assert_eq!(c.delay_for(3), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_delay_is_always_a_table_entry(
            delays in proptest::collection::vec(0u64..100_000, 1..10),
            attempt in 0u32..1000,
        ) {
            let c = RetryController::new(&delays, u32::MAX);
            let d = c.delay_for(attempt).as_millis() as u64;
            let expected = delays[(attempt as usize).min(delays.len() - 1)];
            prop_assert_eq!(d, expected);
        }
    }
}
