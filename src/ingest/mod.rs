// 服务端入库模块
//
// 上传会话 -> 字节完整 -> 内容哈希 -> 重复检查 -> 入库 -> 提交处理

pub mod duplicate;
pub mod repository;
pub mod session;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

pub use duplicate::{DuplicateResolutionGate, GateError};
pub use repository::{
    DuplicateResolution, JobRecord, JobStatus, ProcessingStatus, VideoRecord, VideoRepository,
};
pub use session::{parse_upload_metadata, SessionError, SessionInfo, UploadSessionManager};
pub use storage::{hash_file, VideoStorage};

use crate::processing::ProcessingQueue;
use crate::protocol::{DecisionOutcome, DuplicateDecision, FinalizeOutcome};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// 按键串行化的异步锁，无人持有时自动移除
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

struct KeyedGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    async fn lock(&self, key: String) -> KeyedGuard<'_> {
        let mutex = self.locks.entry(key.clone()).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

fn content_key(content_hash: &str) -> String {
    format!("content:{}", content_hash)
}

/// 入库服务
pub struct IngestService {
    sessions: Arc<UploadSessionManager>,
    repository: Arc<VideoRepository>,
    storage: VideoStorage,
    gate: DuplicateResolutionGate,
    processing: ProcessingQueue,
    // 同一会话的 finalize / 决定串行；同一内容的查重与入库串行
    locks: KeyedLocks,
}

impl IngestService {
    pub fn new(
        sessions: Arc<UploadSessionManager>,
        repository: Arc<VideoRepository>,
        storage: VideoStorage,
        processing: ProcessingQueue,
    ) -> Self {
        Self {
            gate: DuplicateResolutionGate::new(Arc::clone(&repository)),
            sessions,
            repository,
            storage,
            processing,
            locks: KeyedLocks::default(),
        }
    }

    pub fn sessions(&self) -> &UploadSessionManager {
        &self.sessions
    }

    pub fn repository(&self) -> &VideoRepository {
        &self.repository
    }

    pub fn storage(&self) -> &VideoStorage {
        &self.storage
    }

    /// 字节完整后的入库
    ///
    /// 重复调用返回相同结论：已入库返回视频 ID，待决返回冲突信息。
    /// 查重和入库在内容锁内完成，同内容的并发上传只有一个直接入库。
    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeOutcome, IngestError> {
        let _session = self.locks.lock(session_key(session_id)).await;

        if let Some(video) = self.repository.find_by_session(session_id)? {
            return Ok(FinalizeOutcome::Success { video_id: video.id });
        }
        if let Some(pending) = self.gate.pending(session_id)? {
            return Ok(FinalizeOutcome::PendingDuplicate {
                duplicate_of_video_id: pending.duplicate_of_video_id,
                duplicate_of_display_path: pending.duplicate_of_display_path,
            });
        }

        let (info, part_path) = self.sessions.completed(session_id).await?;
        let content_hash = hash_file(&part_path).await?;

        let _content = self.locks.lock(content_key(&content_hash)).await;
        if let Some(existing) = self.repository.find_active_by_hash(&content_hash)? {
            return Ok(self.gate.hold(session_id, &content_hash, &existing)?);
        }

        let video = self.commit(&info, part_path, content_hash).await?;
        Ok(FinalizeOutcome::Success { video_id: video.id })
    }

    /// 执行重复内容的决定
    ///
    /// 执行失败时撤回认领，会话回到待决状态，可以再次决定
    pub async fn resolve_duplicate(
        &self,
        session_id: &str,
        decision: DuplicateDecision,
    ) -> Result<DecisionOutcome, IngestError> {
        let _session = self.locks.lock(session_key(session_id)).await;
        let resolution = self.gate.claim(session_id, decision)?;

        match self.apply_decision(&resolution, decision).await {
            Ok(video_id) => Ok(DecisionOutcome { decision, video_id }),
            Err(e) => {
                match self.gate.release(session_id, decision) {
                    Ok(_) => warn!(
                        "执行决定失败，已撤回: session={} decision={} 错误: {}",
                        session_id,
                        decision.as_str(),
                        e
                    ),
                    Err(release_err) => error!(
                        "撤回决定失败: session={} 错误: {}",
                        session_id, release_err
                    ),
                }
                Err(e)
            }
        }
    }

    async fn apply_decision(
        &self,
        resolution: &DuplicateResolution,
        decision: DuplicateDecision,
    ) -> Result<Option<String>, IngestError> {
        let session_id = &resolution.session_id;
        match decision {
            DuplicateDecision::KeepBoth => {
                let (info, part_path) = self.sessions.completed(session_id).await?;
                let _content = self.locks.lock(content_key(&resolution.content_hash)).await;
                let video = self
                    .commit(&info, part_path, resolution.content_hash.clone())
                    .await?;
                Ok(Some(video.id))
            }
            DuplicateDecision::ReplaceExisting => {
                let (info, part_path) = self.sessions.completed(session_id).await?;
                let _content = self.locks.lock(content_key(&resolution.content_hash)).await;
                // 新视频入库成功后才删除旧视频
                let video = self
                    .commit(&info, part_path, resolution.content_hash.clone())
                    .await?;
                let old = &resolution.duplicate_of_video_id;
                match self.retire_video(old).await {
                    Ok(()) => warn!(
                        "已替换旧视频: {} ({}) -> {}",
                        old, resolution.duplicate_of_display_path, video.id
                    ),
                    Err(e) => error!("删除被替换的视频失败: {} 错误: {}", old, e),
                }
                Ok(Some(video.id))
            }
            DuplicateDecision::CancelUpload => {
                self.sessions.remove(session_id).await?;
                self.gate.discard(session_id)?;
                info!("已放弃重复上传: {}", session_id);
                Ok(None)
            }
        }
    }

    /// 终止会话，删除已接收的数据和待决记录
    pub async fn terminate(&self, session_id: &str) -> Result<bool, IngestError> {
        let _session = self.locks.lock(session_key(session_id)).await;
        let removed = self.sessions.remove(session_id).await?;
        if let Some(pending) = self.gate.pending(session_id)? {
            self.gate.discard(&pending.session_id)?;
        }
        Ok(removed)
    }

    /// 按展示路径查找未删除的视频
    pub fn find_by_path(&self, display_path: &str) -> Result<Option<VideoRecord>, IngestError> {
        Ok(self.repository.find_active_by_path(display_path)?)
    }

    pub fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>, IngestError> {
        Ok(self.repository.get_video(video_id)?)
    }

    /// 软删除记录并清除存储
    async fn retire_video(&self, video_id: &str) -> anyhow::Result<()> {
        self.repository.soft_delete_video(video_id)?;
        self.storage.remove_video_dir(video_id).await?;
        Ok(())
    }

    /// 入库并提交默认流水线
    ///
    /// 返回错误时不会留下视频记录，上传文件仍在会话目录
    async fn commit(
        &self,
        info: &SessionInfo,
        part_path: PathBuf,
        content_hash: String,
    ) -> Result<VideoRecord, IngestError> {
        let video = VideoRecord::new(
            uuid::Uuid::new_v4().to_string(),
            Some(info.id.clone()),
            info.file_name.clone(),
            info.relative_path.clone(),
            content_hash,
            info.upload_length,
        );
        let target = self
            .storage
            .commit(&part_path, &video.id, &info.file_name)
            .await?;
        if let Err(e) = self.repository.insert_video(&video) {
            match tokio::fs::rename(&target, &part_path).await {
                Ok(()) => {
                    if let Err(cleanup) = self.storage.remove_video_dir(&video.id).await {
                        warn!("清理视频目录失败: {} 错误: {}", video.id, cleanup);
                    }
                }
                Err(restore) => error!(
                    "写入视频记录失败后无法还原上传文件: {:?} 错误: {}",
                    target, restore
                ),
            }
            return Err(e.into());
        }
        if let Err(e) = self.sessions.remove(&info.id).await {
            warn!("清理上传会话失败: {} 错误: {}", info.id, e);
        }
        info!("视频已入库: {} -> {}", info.relative_path, video.id);

        let kind = self.processing.default_pipeline();
        if let Err(e) = self.processing.enqueue(&video.id, kind, serde_json::json!({})) {
            warn!("提交处理任务失败: video={}, 错误: {}", video.id, e);
        }
        Ok(video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{
        MemorySlotCounter, PipelineExecutor, PipelineJob, PipelineKind,
        ProcessingAdmissionController,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    struct NoopExecutor;

    #[async_trait]
    impl PipelineExecutor for NoopExecutor {
        async fn run(&self, _job: &PipelineJob) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn service(root: &Path) -> IngestService {
        let repository = Arc::new(VideoRepository::open_in_memory().unwrap());
        let sessions = Arc::new(
            UploadSessionManager::open(root.join("sessions"), 1 << 20, 1 << 30)
                .await
                .unwrap(),
        );
        let processing = ProcessingQueue::new(
            Arc::clone(&repository),
            ProcessingAdmissionController::new(
                2,
                Arc::new(MemorySlotCounter::new()),
                Duration::from_millis(10),
            ),
            Arc::new(NoopExecutor),
            root.join("videos"),
            Duration::from_secs(60),
            PipelineKind::FrameExtraction,
            "ingest-test".to_string(),
        );
        IngestService::new(sessions, repository, VideoStorage::new(root.join("videos")), processing)
    }

    async fn upload(svc: &IngestService, path: &str, data: &[u8]) -> String {
        let name = Path::new(path).file_name().unwrap().to_string_lossy().to_string();
        let meta = HashMap::from([
            ("filename".to_string(), name),
            ("relative_path".to_string(), path.to_string()),
        ]);
        let s = svc.sessions().create(data.len() as u64, meta).await.unwrap();
        svc.sessions().append(&s.id, 0, data).await.unwrap();
        s.id
    }

    fn success(outcome: FinalizeOutcome) -> String {
        match outcome {
            FinalizeOutcome::Success { video_id } => video_id,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        let s = upload(&svc, "trip/a.mp4", b"first").await;

        let video_id = success(svc.finalize(&s).await.unwrap());
        assert_eq!(success(svc.finalize(&s).await.unwrap()), video_id);
        assert!(svc.storage().video_dir(&video_id).join("a.mp4").exists());
        assert!(svc.find_by_path("trip/a.mp4").unwrap().is_some());
        assert!(!svc.sessions().contains(&s));
    }

    #[tokio::test]
    async fn test_incomplete_upload_cannot_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        let meta = HashMap::from([("filename".to_string(), "a.mp4".to_string())]);
        let s = svc.sessions().create(10, meta).await.unwrap();
        assert!(matches!(
            svc.finalize(&s.id).await,
            Err(IngestError::Session(SessionError::Incomplete { .. }))
        ));
    }

    #[tokio::test]
    async fn test_replace_existing() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        let first = success(svc.finalize(&upload(&svc, "a.mp4", b"same").await).await.unwrap());

        let s2 = upload(&svc, "copy/a.mp4", b"same").await;
        let outcome = svc.finalize(&s2).await.unwrap();
        assert_eq!(
            outcome,
            FinalizeOutcome::PendingDuplicate {
                duplicate_of_video_id: first.clone(),
                duplicate_of_display_path: "a.mp4".into(),
            }
        );
        // 待决期间重复 finalize 返回同一结论
        assert_eq!(svc.finalize(&s2).await.unwrap(), outcome);

        let result = svc
            .resolve_duplicate(&s2, DuplicateDecision::ReplaceExisting)
            .await
            .unwrap();
        let second = result.video_id.unwrap();
        assert!(!svc.storage().video_dir(&first).exists());
        assert!(svc.get_video(&first).unwrap().unwrap().is_deleted());
        assert!(svc.storage().video_dir(&second).exists());

        // 第二次决定被拒绝，不会再次删除
        assert!(matches!(
            svc.resolve_duplicate(&s2, DuplicateDecision::ReplaceExisting).await,
            Err(IngestError::Gate(GateError::AlreadyDecided(_)))
        ));
        assert!(svc.storage().video_dir(&second).exists());
    }

    #[tokio::test]
    async fn test_keep_both() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        let first = success(svc.finalize(&upload(&svc, "a.mp4", b"same").await).await.unwrap());
        let s2 = upload(&svc, "b.mp4", b"same").await;
        svc.finalize(&s2).await.unwrap();

        let second = svc
            .resolve_duplicate(&s2, DuplicateDecision::KeepBoth)
            .await
            .unwrap()
            .video_id
            .unwrap();
        assert_ne!(first, second);
        for id in [&first, &second] {
            let v = svc.get_video(id).unwrap().unwrap();
            assert!(!v.is_deleted());
            assert_ne!(v.processing_status, ProcessingStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_cancel_upload_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        success(svc.finalize(&upload(&svc, "a.mp4", b"same").await).await.unwrap());
        let s2 = upload(&svc, "b.mp4", b"same").await;
        svc.finalize(&s2).await.unwrap();

        let outcome = svc
            .resolve_duplicate(&s2, DuplicateDecision::CancelUpload)
            .await
            .unwrap();
        assert!(outcome.video_id.is_none());

        assert!(!svc.sessions().contains(&s2));
        assert_eq!(std::fs::read_dir(dir.path().join("sessions")).unwrap().count(), 0);
        assert!(svc.repository().get_resolution(&s2).unwrap().is_none());
        assert!(svc.repository().find_by_session(&s2).unwrap().is_none());
        assert!(matches!(
            svc.resolve_duplicate(&s2, DuplicateDecision::KeepBoth).await,
            Err(IngestError::Gate(GateError::NotFound(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_content_admits_one() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;

        for round in 0..10 {
            let data = format!("round-{}", round).into_bytes();
            let a = upload(&svc, &format!("{}/a.mp4", round), &data).await;
            let b = upload(&svc, &format!("{}/b.mp4", round), &data).await;

            let (ra, rb) = tokio::join!(svc.finalize(&a), svc.finalize(&b));
            let outcomes = [ra.unwrap(), rb.unwrap()];
            let committed = outcomes
                .iter()
                .filter(|o| matches!(o, FinalizeOutcome::Success { .. }))
                .count();
            assert_eq!(committed, 1, "round {}: {:?}", round, outcomes);
            assert!(outcomes
                .iter()
                .any(|o| matches!(o, FinalizeOutcome::PendingDuplicate { .. })));
        }
        assert_eq!(svc.locks.len(), 0);
    }

    /// 把视频根目录换成普通文件，使入库时创建目录失败
    fn break_videos_dir(root: &Path) {
        std::fs::rename(root.join("videos"), root.join("videos.bak")).unwrap();
        std::fs::write(root.join("videos"), b"not a dir").unwrap();
    }

    fn restore_videos_dir(root: &Path) {
        std::fs::remove_file(root.join("videos")).unwrap();
        std::fs::rename(root.join("videos.bak"), root.join("videos")).unwrap();
    }

    #[tokio::test]
    async fn test_failed_decision_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        success(svc.finalize(&upload(&svc, "a.mp4", b"same").await).await.unwrap());
        let s2 = upload(&svc, "b.mp4", b"same").await;
        svc.finalize(&s2).await.unwrap();

        break_videos_dir(dir.path());
        assert!(svc.resolve_duplicate(&s2, DuplicateDecision::KeepBoth).await.is_err());
        assert!(svc.gate.pending(&s2).unwrap().is_some());
        assert!(matches!(
            svc.finalize(&s2).await.unwrap(),
            FinalizeOutcome::PendingDuplicate { .. }
        ));

        restore_videos_dir(dir.path());
        let second = svc
            .resolve_duplicate(&s2, DuplicateDecision::KeepBoth)
            .await
            .unwrap()
            .video_id
            .unwrap();
        assert!(svc.storage().video_dir(&second).join("b.mp4").exists());
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_existing_video() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        let first = success(svc.finalize(&upload(&svc, "a.mp4", b"same").await).await.unwrap());
        let s2 = upload(&svc, "copy/a.mp4", b"same").await;
        svc.finalize(&s2).await.unwrap();

        break_videos_dir(dir.path());
        assert!(svc
            .resolve_duplicate(&s2, DuplicateDecision::ReplaceExisting)
            .await
            .is_err());
        restore_videos_dir(dir.path());

        assert!(!svc.get_video(&first).unwrap().unwrap().is_deleted());
        assert!(svc.storage().video_dir(&first).join("a.mp4").exists());
        assert!(svc.sessions().contains(&s2));

        let second = svc
            .resolve_duplicate(&s2, DuplicateDecision::ReplaceExisting)
            .await
            .unwrap()
            .video_id
            .unwrap();
        assert!(svc.get_video(&first).unwrap().unwrap().is_deleted());
        assert!(!svc.storage().video_dir(&first).exists());
        assert!(svc.storage().video_dir(&second).exists());
    }

    #[tokio::test]
    async fn test_deleted_video_is_not_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        let first = success(svc.finalize(&upload(&svc, "a.mp4", b"same").await).await.unwrap());
        svc.repository().soft_delete_video(&first).unwrap();

        let s2 = upload(&svc, "b.mp4", b"same").await;
        success(svc.finalize(&s2).await.unwrap());
    }
}
