//! 重复内容决定关卡
//!
//! 上传字节完整且内容哈希与未删除视频相同时，入库暂停，等待客户端决定。
//! 每个会话只有一条待决记录；决定通过条件更新认领，只会执行一次。

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::repository::{DuplicateResolution, VideoRecord, VideoRepository};
use crate::protocol::{DuplicateDecision, FinalizeOutcome};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("没有等待决定的重复内容: {0}")]
    NotFound(String),
    #[error("已做出决定: {0}")]
    AlreadyDecided(&'static str),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct DuplicateResolutionGate {
    repository: Arc<VideoRepository>,
}

impl DuplicateResolutionGate {
    pub fn new(repository: Arc<VideoRepository>) -> Self {
        Self { repository }
    }

    /// 记录冲突并挂起入库
    pub fn hold(
        &self,
        session_id: &str,
        content_hash: &str,
        existing: &VideoRecord,
    ) -> Result<FinalizeOutcome, GateError> {
        let resolution = DuplicateResolution {
            session_id: session_id.to_string(),
            content_hash: content_hash.to_string(),
            duplicate_of_video_id: existing.id.clone(),
            duplicate_of_display_path: existing.display_path.clone(),
            user_decision: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            resolved_at: None,
        };
        if self.repository.insert_resolution(&resolution)? {
            info!(
                "内容重复，等待决定: session={} 与 video={} ({}) 相同",
                session_id, existing.id, existing.display_path
            );
        }
        Ok(FinalizeOutcome::PendingDuplicate {
            duplicate_of_video_id: existing.id.clone(),
            duplicate_of_display_path: existing.display_path.clone(),
        })
    }

    /// 仍在等待决定的记录
    pub fn pending(&self, session_id: &str) -> Result<Option<DuplicateResolution>, GateError> {
        Ok(self
            .repository
            .get_resolution(session_id)?
            .filter(|r| r.user_decision.is_none()))
    }

    /// 认领决定，每个会话只有第一次调用成功
    pub fn claim(
        &self,
        session_id: &str,
        decision: DuplicateDecision,
    ) -> Result<DuplicateResolution, GateError> {
        let mut resolution = self
            .repository
            .get_resolution(session_id)?
            .ok_or_else(|| GateError::NotFound(session_id.to_string()))?;
        if let Some(previous) = resolution.user_decision {
            return Err(GateError::AlreadyDecided(previous.as_str()));
        }
        if !self.repository.claim_resolution(session_id, decision)? {
            // 并发请求抢先认领
            let previous = self
                .repository
                .get_resolution(session_id)?
                .and_then(|r| r.user_decision)
                .map_or("unknown", |d| d.as_str());
            return Err(GateError::AlreadyDecided(previous));
        }
        resolution.user_decision = Some(decision);
        info!("重复内容决定已认领: session={} decision={}", session_id, decision.as_str());
        Ok(resolution)
    }

    /// 撤回认领，会话重新等待决定
    pub fn release(&self, session_id: &str, decision: DuplicateDecision) -> Result<bool, GateError> {
        let released = self.repository.unclaim_resolution(session_id, decision)?;
        if released {
            info!("重复内容决定已撤回: session={} decision={}", session_id, decision.as_str());
        }
        Ok(released)
    }

    /// 删除待决记录（cancel_upload 或会话终止）
    pub fn discard(&self, session_id: &str) -> Result<bool, GateError> {
        Ok(self.repository.delete_resolution(session_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing() -> VideoRecord {
        VideoRecord::new(
            "v1".into(),
            None,
            "a.mp4".into(),
            "trip/a.mp4".into(),
            "hash".into(),
            10,
        )
    }

    #[test]
    fn test_hold_then_claim_once() {
        let gate = DuplicateResolutionGate::new(Arc::new(VideoRepository::open_in_memory().unwrap()));
        let outcome = gate.hold("s1", "hash", &existing()).unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::PendingDuplicate {
                duplicate_of_video_id: "v1".into(),
                duplicate_of_display_path: "trip/a.mp4".into(),
            }
        );
        assert!(gate.pending("s1").unwrap().is_some());

        let claimed = gate.claim("s1", DuplicateDecision::ReplaceExisting).unwrap();
        assert_eq!(claimed.duplicate_of_video_id, "v1");
        assert!(gate.pending("s1").unwrap().is_none());

        assert!(matches!(
            gate.claim("s1", DuplicateDecision::ReplaceExisting),
            Err(GateError::AlreadyDecided("replace_existing"))
        ));
    }

    #[test]
    fn test_release_reopens_decision() {
        let gate = DuplicateResolutionGate::new(Arc::new(VideoRepository::open_in_memory().unwrap()));
        gate.hold("s1", "hash", &existing()).unwrap();
        gate.claim("s1", DuplicateDecision::KeepBoth).unwrap();

        // 只撤回同一个决定
        assert!(!gate.release("s1", DuplicateDecision::CancelUpload).unwrap());
        assert!(gate.pending("s1").unwrap().is_none());

        assert!(gate.release("s1", DuplicateDecision::KeepBoth).unwrap());
        let pending = gate.pending("s1").unwrap().unwrap();
        assert!(pending.resolved_at.is_none());
        gate.claim("s1", DuplicateDecision::ReplaceExisting).unwrap();
    }

    #[test]
    fn test_claim_without_hold() {
        let gate = DuplicateResolutionGate::new(Arc::new(VideoRepository::open_in_memory().unwrap()));
        assert!(matches!(
            gate.claim("nope", DuplicateDecision::KeepBoth),
            Err(GateError::NotFound(_))
        ));
    }
}
