//! 上传停滞检测
//!
//! 记录每个上传最后一次字节进度的时间，超过超时时间没有进度即视为停滞。
//! 不关心底层请求是否仍在等待，只看进度。

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// 停滞检测器
#[derive(Debug)]
pub struct StallMonitor {
    timeout: Duration,
    last_progress: HashMap<String, Instant>,
}

impl StallMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_progress: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 开始监控（进入 uploading 时调用，计时从此刻开始）
    pub fn track(&mut self, id: &str, now: Instant) {
        self.last_progress.insert(id.to_string(), now);
    }

    /// 收到字节进度，重置计时
    pub fn record_progress(&mut self, id: &str, now: Instant) {
        if let Some(last) = self.last_progress.get_mut(id) {
            *last = now;
        }
    }

    pub fn untrack(&mut self, id: &str) {
        self.last_progress.remove(id);
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.last_progress.contains_key(id)
    }

    /// 返回所有已停滞的上传 ID
    pub fn stalled(&self, now: Instant) -> Vec<String> {
        let mut ids: Vec<String> = self
            .last_progress
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) >= self.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stall_after_timeout() {
        let mut monitor = StallMonitor::new(Duration::from_secs(60));
        let t0 = Instant::now();
        monitor.track("a", t0);
        monitor.track("b", t0);

        assert!(monitor.stalled(t0 + Duration::from_secs(59)).is_empty());

        monitor.record_progress("b", t0 + Duration::from_secs(30));
        assert_eq!(monitor.stalled(t0 + Duration::from_secs(60)), vec!["a"]);
        assert_eq!(
            monitor.stalled(t0 + Duration::from_secs(90)),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_untracked_never_stalls() {
        let mut monitor = StallMonitor::new(Duration::from_millis(10));
        let t0 = Instant::now();
        monitor.track("a", t0);
        monitor.untrack("a");
        monitor.record_progress("a", t0);

        assert!(!monitor.is_tracked("a"));
        assert!(monitor.stalled(t0 + Duration::from_secs(1)).is_empty());
    }
}
