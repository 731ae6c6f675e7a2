// 处理队列
//
// 每个任务由一个监督任务驱动：
// 1. 等待准入槽位
// 2. 在独立任务中执行流水线（捕获 panic）
// 3. 超过 job_timeout 时中止执行并记为失败
// 许可在监督任务的所有退出路径上释放

use anyhow::Result;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::admission::{AdmissionSnapshot, ProcessingAdmissionController};
use super::pipeline::{PipelineExecutor, PipelineJob};
use super::PipelineKind;
use crate::ingest::repository::{JobRecord, JobStatus, ProcessingStatus, VideoRepository};

/// 启动恢复时遗留任务的失败原因
pub const INTERRUPTED_REASON: &str = "interrupted";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("视频不存在: {0}")]
    VideoNotFound(String),
    #[error("视频 {0} 当前不处于 error 状态")]
    NotInError(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

struct Inner {
    repository: Arc<VideoRepository>,
    admission: ProcessingAdmissionController,
    executor: Arc<dyn PipelineExecutor>,
    videos_dir: PathBuf,
    job_timeout: Duration,
    default_pipeline: PipelineKind,
    instance_id: String,
    /// 未结束任务的取消令牌
    jobs: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

/// 后台处理队列
#[derive(Clone)]
pub struct ProcessingQueue {
    inner: Arc<Inner>,
}

impl ProcessingQueue {
    pub fn new(
        repository: Arc<VideoRepository>,
        admission: ProcessingAdmissionController,
        executor: Arc<dyn PipelineExecutor>,
        videos_dir: PathBuf,
        job_timeout: Duration,
        default_pipeline: PipelineKind,
        instance_id: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                admission,
                executor,
                videos_dir,
                job_timeout,
                default_pipeline,
                instance_id,
                jobs: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn default_pipeline(&self) -> PipelineKind {
        self.inner.default_pipeline
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// 提交处理任务，返回任务记录
    pub fn enqueue(
        &self,
        video_id: &str,
        kind: PipelineKind,
        parameters: serde_json::Value,
    ) -> Result<JobRecord, QueueError> {
        let video = self
            .inner
            .repository
            .get_video(video_id)?
            .filter(|v| !v.is_deleted())
            .ok_or_else(|| QueueError::VideoNotFound(video_id.to_string()))?;

        let job = JobRecord::new(video.id.clone(), kind, parameters, &self.inner.instance_id);
        self.inner.repository.insert_job(&job)?;
        self.inner
            .repository
            .set_processing_status(&video.id, ProcessingStatus::Queued, None)?;

        info!("处理任务已入队: job={} video={} kind={}", job.id, video.id, kind);
        self.spawn_supervisor(job.clone());
        Ok(job)
    }

    /// 重新提交处理失败的视频
    ///
    /// 沿用最近一次任务的流水线和参数；没有历史任务时使用默认流水线
    pub fn retry_video(&self, video_id: &str) -> Result<JobRecord, QueueError> {
        let repo = &self.inner.repository;
        if repo.get_video(video_id)?.filter(|v| !v.is_deleted()).is_none() {
            return Err(QueueError::VideoNotFound(video_id.to_string()));
        }
        if !repo.reset_processing_error(video_id)? {
            return Err(QueueError::NotInError(video_id.to_string()));
        }
        let (kind, parameters) = match repo.latest_job_for_video(video_id)? {
            Some(job) => (job.pipeline_kind, job.parameters),
            None => (self.inner.default_pipeline, serde_json::json!({})),
        };
        info!("重新提交处理: video={} kind={}", video_id, kind);
        self.enqueue(video_id, kind, parameters)
    }

    /// 启动时把本实例上次运行遗留的任务标记为失败（可通过 retry 重新提交）
    pub fn recover_interrupted(&self) -> Result<usize> {
        let jobs = self
            .inner
            .repository
            .fail_interrupted_jobs(&self.inner.instance_id, INTERRUPTED_REASON)?;
        for job in &jobs {
            warn!("处理任务被中断: job={} video={}", job.id, job.video_id);
        }
        Ok(jobs.len())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.inner.repository.get_job(job_id)
    }

    pub fn status(&self) -> AdmissionSnapshot {
        self.inner.admission.snapshot()
    }

    /// 未结束的任务数
    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.len()
    }

    /// 中止所有未结束的任务
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.admission.close();
    }

    fn spawn_supervisor(&self, job: JobRecord) {
        let cancel = self.inner.shutdown.child_token();
        self.inner.jobs.insert(job.id.clone(), cancel.clone());
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let job_id = job.id.clone();
            let video_id = job.video_id.clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err("cancelled".to_string()),
                outcome = inner.supervise(job) => outcome,
            };
            inner.jobs.remove(&job_id);
            inner.record_outcome(&job_id, &video_id, outcome);
        });
    }
}

/// 监督任务被取消时一并中止流水线
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Inner {
    /// 等待槽位并执行，返回失败原因
    async fn supervise(&self, job: JobRecord) -> Result<(), String> {
        let permit = self
            .admission
            .acquire(job.pipeline_kind, &job.video_id)
            .await
            .map_err(|e| e.to_string())?;

        if let Err(e) = self.repository.mark_job_running(&job.id) {
            warn!("更新任务状态失败: {}, 错误: {}", job.id, e);
        }
        if let Err(e) =
            self.repository
                .set_processing_status(&job.video_id, ProcessingStatus::Running, None)
        {
            warn!("更新视频处理状态失败: {}, 错误: {}", job.video_id, e);
        }
        info!("处理任务开始: job={} video={} kind={}", job.id, job.video_id, job.pipeline_kind);

        let pipeline_job = PipelineJob {
            job_id: job.id.clone(),
            video_id: job.video_id.clone(),
            kind: job.pipeline_kind,
            video_dir: self.videos_dir.join(&job.video_id),
            parameters: job.parameters,
        };
        let executor = Arc::clone(&self.executor);
        let mut handle = AbortOnDrop(tokio::spawn(async move { executor.run(&pipeline_job).await }));

        let result = match tokio::time::timeout(self.job_timeout, &mut handle.0).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
            Ok(Err(join_err)) if join_err.is_panic() => Err("流水线执行 panic".to_string()),
            Ok(Err(join_err)) => Err(join_err.to_string()),
            Err(_) => {
                handle.0.abort();
                error!("处理任务超时，已强制释放槽位: job={} 超时={:?}", job.id, self.job_timeout);
                Err(format!("超时 ({}s)", self.job_timeout.as_secs()))
            }
        };

        drop(permit);
        result
    }

    fn record_outcome(&self, job_id: &str, video_id: &str, outcome: Result<(), String>) {
        let (job_status, video_status, err) = match &outcome {
            Ok(()) => (JobStatus::Completed, ProcessingStatus::Complete, None),
            Err(e) => (JobStatus::Failed, ProcessingStatus::Error, Some(e.as_str())),
        };
        if let Err(e) = self.repository.mark_job_finished(job_id, job_status, err) {
            warn!("更新任务状态失败: {}, 错误: {}", job_id, e);
        }
        if let Err(e) = self.repository.set_processing_status(video_id, video_status, err) {
            warn!("更新视频处理状态失败: {}, 错误: {}", video_id, e);
        }
        match outcome {
            Ok(()) => info!("处理任务完成: job={} video={}", job_id, video_id),
            Err(e) => error!("处理任务失败: job={} video={}: {}", job_id, video_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::repository::VideoRecord;
    use crate::processing::counter::MemorySlotCounter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// 每个任务需要一个放行许可；视频 ID 以 "panic" 开头时 panic，以 "fail" 开头时失败
    struct GatedExecutor {
        gate: Semaphore,
        running: AtomicUsize,
    }

    #[async_trait]
    impl PipelineExecutor for GatedExecutor {
        async fn run(&self, job: &PipelineJob) -> Result<()> {
            self.running.fetch_add(1, Ordering::SeqCst);
            let _guard = Running(&self.running);
            if job.video_id.starts_with("panic") {
                panic!("decoder crashed");
            }
            let permit = self.gate.acquire().await?;
            permit.forget();
            if job.video_id.starts_with("fail") {
                anyhow::bail!("ocr failed");
            }
            Ok(())
        }
    }

    struct Running<'a>(&'a AtomicUsize);

    impl Drop for Running<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn setup(max: usize, timeout: Duration) -> (ProcessingQueue, Arc<VideoRepository>, Arc<GatedExecutor>) {
        let repo = Arc::new(VideoRepository::open_in_memory().unwrap());
        let executor = Arc::new(GatedExecutor {
            gate: Semaphore::new(0),
            running: AtomicUsize::new(0),
        });
        let queue = ProcessingQueue::new(
            repo.clone(),
            ProcessingAdmissionController::new(
                max,
                Arc::new(MemorySlotCounter::new()),
                Duration::from_millis(10),
            ),
            executor.clone(),
            PathBuf::from("videos"),
            timeout,
            PipelineKind::FrameExtraction,
            "ingest-a".to_string(),
        );
        (queue, repo, executor)
    }

    fn add_video(repo: &VideoRepository, id: &str) {
        repo.insert_video(&VideoRecord::new(
            id.into(),
            None,
            format!("{}.mp4", id),
            format!("dir/{}.mp4", id),
            format!("hash-{}", id),
            10,
        ))
        .unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn video_status(repo: &VideoRepository, id: &str) -> ProcessingStatus {
        repo.get_video(id).unwrap().unwrap().processing_status
    }

    #[tokio::test]
    async fn test_admission_bounds_running_jobs() {
        let (queue, repo, executor) = setup(2, Duration::from_secs(60));
        for id in ["v1", "v2", "v3"] {
            add_video(&repo, id);
            queue.enqueue(id, PipelineKind::FrameExtraction, serde_json::json!({})).unwrap();
        }

        wait_until(|| executor.running.load(Ordering::SeqCst) == 2 && queue.status().waiting == 1).await;
        assert_eq!(queue.status().running.len(), 2);
        assert_eq!(video_status(&repo, "v3"), ProcessingStatus::Queued);

        // 完成一个，恰好放行一个
        executor.gate.add_permits(1);
        wait_until(|| queue.status().waiting == 0).await;
        wait_until(|| executor.running.load(Ordering::SeqCst) == 2).await;
        assert_eq!(queue.status().running.len(), 2);

        executor.gate.add_permits(2);
        wait_until(|| queue.pending_jobs() == 0).await;
        for id in ["v1", "v2", "v3"] {
            assert_eq!(video_status(&repo, id), ProcessingStatus::Complete);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_releases_slot_of_hung_job() {
        let (queue, repo, executor) = setup(1, Duration::from_secs(30));
        add_video(&repo, "hung");
        add_video(&repo, "next");
        let hung = queue.enqueue("hung", PipelineKind::Cropping, serde_json::json!({})).unwrap();
        queue.enqueue("next", PipelineKind::Cropping, serde_json::json!({})).unwrap();

        wait_until(|| video_status(&repo, "hung") == ProcessingStatus::Error).await;
        let job = repo.get_job(&hung.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("超时"));

        // 槽位已归还，下一个任务获得准入
        wait_until(|| video_status(&repo, "next") == ProcessingStatus::Running).await;
        executor.gate.add_permits(1);
        wait_until(|| video_status(&repo, "next") == ProcessingStatus::Complete).await;
    }

    #[tokio::test]
    async fn test_panicking_job_fails_and_frees_slot() {
        let (queue, repo, executor) = setup(1, Duration::from_secs(60));
        add_video(&repo, "panic-1");
        add_video(&repo, "ok");
        queue.enqueue("panic-1", PipelineKind::FrameExtraction, serde_json::json!({})).unwrap();
        queue.enqueue("ok", PipelineKind::FrameExtraction, serde_json::json!({})).unwrap();

        wait_until(|| video_status(&repo, "panic-1") == ProcessingStatus::Error).await;
        executor.gate.add_permits(1);
        wait_until(|| video_status(&repo, "ok") == ProcessingStatus::Complete).await;
        assert_eq!(queue.status().running.len(), 0);
    }

    #[tokio::test]
    async fn test_retry_only_from_error() {
        let (queue, repo, executor) = setup(2, Duration::from_secs(60));
        add_video(&repo, "fail-1");
        queue
            .enqueue("fail-1", PipelineKind::Cropping, serde_json::json!({"top": 10}))
            .unwrap();

        assert!(matches!(queue.retry_video("fail-1"), Err(QueueError::NotInError(_))));

        executor.gate.add_permits(1);
        wait_until(|| video_status(&repo, "fail-1") == ProcessingStatus::Error).await;

        let retried = queue.retry_video("fail-1").unwrap();
        assert_eq!(retried.pipeline_kind, PipelineKind::Cropping);
        assert_eq!(retried.parameters["top"], 10);
        assert_eq!(repo.get_video("fail-1").unwrap().unwrap().processing_attempts, 1);

        assert!(matches!(queue.retry_video("missing"), Err(QueueError::VideoNotFound(_))));
        executor.gate.add_permits(1);
        wait_until(|| queue.pending_jobs() == 0).await;
    }

    #[tokio::test]
    async fn test_enqueue_unknown_or_deleted_video() {
        let (queue, repo, _executor) = setup(1, Duration::from_secs(60));
        assert!(matches!(
            queue.enqueue("nope", PipelineKind::Cropping, serde_json::json!({})),
            Err(QueueError::VideoNotFound(_))
        ));
        add_video(&repo, "gone");
        repo.soft_delete_video("gone").unwrap();
        assert!(matches!(
            queue.enqueue("gone", PipelineKind::Cropping, serde_json::json!({})),
            Err(QueueError::VideoNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_jobs() {
        let (queue, repo, _executor) = setup(1, Duration::from_secs(60));
        add_video(&repo, "v1");
        add_video(&repo, "v2");
        let job = JobRecord::new(
            "v1".into(),
            PipelineKind::FrameExtraction,
            serde_json::json!({}),
            queue.instance_id(),
        );
        repo.insert_job(&job).unwrap();
        repo.mark_job_running(&job.id).unwrap();
        // 另一个实例正在运行的任务
        let other = JobRecord::new("v2".into(), PipelineKind::Cropping, serde_json::json!({}), "ingest-b");
        repo.insert_job(&other).unwrap();
        repo.mark_job_running(&other.id).unwrap();

        assert_eq!(queue.recover_interrupted().unwrap(), 1);
        assert_eq!(video_status(&repo, "v1"), ProcessingStatus::Error);
        let stored = queue.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.error.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(queue.get_job(&other.id).unwrap().unwrap().status, JobStatus::Running);
    }
}
