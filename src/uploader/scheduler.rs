// 上传调度器
//
// - 全局并发上限：最多 concurrent_uploads 个上传占用槽位（uploading / stalled / retrying）
// - 严格 FIFO：queued 按入队顺序晋升
// - 每个上传一个 worker 任务，由 CancellationToken + JoinHandle 控制
// - 停滞检测循环定期检查，停滞的上传按重试表进入 retrying 或 error
// - 所有状态变更在同一把锁内完成，事件按变更顺序发出

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::events::{ProgressThrottler, UploadEvent, DEFAULT_THROTTLE_INTERVAL_MS};
use crate::persistence::PersistentUploadStore;
use crate::protocol::{DecisionOutcome, DuplicateDecision, FinalizeOutcome};
use crate::uploader::chunk::{read_range, ChunkPlan};
use crate::uploader::folder::CollectedFile;
use crate::uploader::retry::{RetryController, RetryDecision, UploadErrorKind};
use crate::uploader::stall::StallMonitor;
use crate::uploader::task::{DuplicateInfo, UploadMetadata, UploadStatus};
use crate::uploader::transport::{ResumableTransport, TransportError};

/// 连续偏移量冲突上限，超过视为协议错误
const MAX_CONSECUTIVE_CONFLICTS: u32 = 8;

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrent_uploads: usize,
    pub retry_delays_ms: Vec<u64>,
    pub max_retries: u32,
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
    pub chunk_size: u64,
    pub progress_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for SchedulerConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            concurrent_uploads: config.concurrent_uploads.max(1),
            retry_delays_ms: config.retry_delays_ms.clone(),
            max_retries: config.max_retries,
            stall_timeout: config.stall_timeout(),
            stall_check_interval: config.stall_check_interval(),
            chunk_size: config.chunk_size,
            progress_interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
        }
    }
}

/// 调度器错误
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("上传不存在: {0}")]
    NotFound(String),
    #[error("上传 {id} 当前状态为 {status}，不能{action}")]
    InvalidState {
        id: String,
        status: UploadStatus,
        action: &'static str,
    },
    #[error("上传 {0} 没有会话句柄")]
    NoSession(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// 聚合状态
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStatus {
    pub total: usize,
    pub counts: HashMap<UploadStatus, usize>,
    /// 占用槽位的上传数
    pub active: usize,
    pub any_error: bool,
    /// 有上传处于停滞或等待重试
    pub any_stalled: bool,
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
}

/// worker 结束原因
#[derive(Debug)]
enum WorkerError {
    Transport(TransportError),
    LocalIo(String),
    /// 已被暂停、取消或被新的 worker 取代
    Superseded,
}

impl WorkerError {
    fn kind(&self) -> UploadErrorKind {
        match self {
            WorkerError::Transport(e) => e.kind(),
            WorkerError::LocalIo(_) => UploadErrorKind::LocalIo,
            WorkerError::Superseded => UploadErrorKind::Network,
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Transport(e) => write!(f, "{}", e),
            WorkerError::LocalIo(e) => write!(f, "本地文件读取失败: {}", e),
            WorkerError::Superseded => write!(f, "已被取代"),
        }
    }
}

impl From<TransportError> for WorkerError {
    fn from(e: TransportError) -> Self {
        WorkerError::Transport(e)
    }
}

struct UploadEntry {
    meta: UploadMetadata,
    throttler: ProgressThrottler,
}

struct WorkerHandle {
    worker_id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

struct State {
    uploads: HashMap<String, UploadEntry>,
    /// 加入顺序，用于列表展示
    order: Vec<String>,
    /// 等待槽位的 FIFO 队列
    queue: VecDeque<String>,
    workers: HashMap<String, WorkerHandle>,
    stall: StallMonitor,
}

impl State {
    fn active_count(&self) -> usize {
        self.uploads
            .values()
            .filter(|e| e.meta.status.holds_slot())
            .count()
    }

    fn stop_worker(&mut self, id: &str) {
        if let Some(worker) = self.workers.remove(id) {
            worker.stop();
        }
    }

    /// worker 仍是当前 worker 时返回上传记录
    fn current_entry(&mut self, id: &str, worker_id: u64) -> Option<&mut UploadEntry> {
        if self.workers.get(id).map(|w| w.worker_id) != Some(worker_id) {
            return None;
        }
        self.uploads.get_mut(id)
    }
}

struct Inner {
    config: SchedulerConfig,
    retry: RetryController,
    transport: Arc<dyn ResumableTransport>,
    store: PersistentUploadStore,
    events: mpsc::UnboundedSender<UploadEvent>,
    state: Mutex<State>,
    next_worker_id: AtomicU64,
    shutdown: CancellationToken,
}

/// 上传调度器
///
/// 可克隆的句柄；所有克隆共享同一份状态。必须在 tokio 运行时内创建。
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<Inner>,
}

impl UploadScheduler {
    pub fn new(
        config: SchedulerConfig,
        transport: Arc<dyn ResumableTransport>,
        store: PersistentUploadStore,
    ) -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            retry: RetryController::new(&config.retry_delays_ms, config.max_retries),
            state: Mutex::new(State {
                uploads: HashMap::new(),
                order: Vec::new(),
                queue: VecDeque::new(),
                workers: HashMap::new(),
                stall: StallMonitor::new(config.stall_timeout),
            }),
            config,
            transport,
            store,
            events: tx,
            next_worker_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        spawn_stall_loop(Arc::downgrade(&inner), inner.shutdown.clone(), inner.config.stall_check_interval);

        info!(
            "上传调度器已启动: 并发上限={}, 最大重试={}, 停滞超时={:?}",
            inner.config.concurrent_uploads, inner.config.max_retries, inner.config.stall_timeout
        );

        (Self { inner }, rx)
    }

    /// 加入一个新上传（pending -> queued），返回上传 ID
    pub fn enqueue(&self, meta: UploadMetadata) -> Result<String, SchedulerError> {
        if meta.status != UploadStatus::Pending {
            return Err(SchedulerError::InvalidState {
                id: meta.id,
                status: meta.status,
                action: "入队",
            });
        }
        let id = meta.id.clone();
        let mut state = self.inner.state.lock();
        self.inner.insert(&mut state, meta);
        self.inner.change_status(&mut state, &id, UploadStatus::Queued);
        state.queue.push_back(id.clone());
        self.inner.pump(&mut state);
        Ok(id)
    }

    /// 批量加入收集到的文件
    pub fn enqueue_files(&self, files: Vec<CollectedFile>) -> Vec<String> {
        files
            .into_iter()
            .filter_map(|f| {
                self.enqueue(UploadMetadata::new(f.local_path, f.relative_path, f.size))
                    .ok()
            })
            .collect()
    }

    /// 恢复持久化的上传（状态已由恢复流程归一化）
    pub fn restore(&self, meta: UploadMetadata) {
        let mut state = self.inner.state.lock();
        if state.uploads.contains_key(&meta.id) {
            return;
        }
        let id = meta.id.clone();
        let queued = meta.status == UploadStatus::Queued;
        self.inner.insert(&mut state, meta);
        if queued {
            state.queue.push_back(id);
            self.inner.pump(&mut state);
        }
    }

    /// 暂停：queued / uploading / stalled / retrying -> paused
    pub fn pause(&self, id: &str) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.lock();
        let status = status_of(&state, id)?;
        if !status.can_transition_to(UploadStatus::Paused) {
            return Err(SchedulerError::InvalidState {
                id: id.to_string(),
                status,
                action: "暂停",
            });
        }
        state.stop_worker(id);
        state.queue.retain(|q| q != id);
        state.stall.untrack(id);
        self.inner.change_status(&mut state, id, UploadStatus::Paused);
        info!("上传已暂停: {}", id);
        self.inner.pump(&mut state);
        Ok(())
    }

    /// 继续：paused -> queued，排到队尾
    pub fn resume(&self, id: &str) -> Result<(), SchedulerError> {
        self.requeue(id, UploadStatus::Paused, "继续")
    }

    /// 手动重试失败的上传：error -> queued
    pub fn retry_upload(&self, id: &str) -> Result<(), SchedulerError> {
        self.requeue(id, UploadStatus::Error, "重试")
    }

    fn requeue(&self, id: &str, expected: UploadStatus, action: &'static str) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.lock();
        let status = status_of(&state, id)?;
        if status != expected {
            return Err(SchedulerError::InvalidState {
                id: id.to_string(),
                status,
                action,
            });
        }
        if expected == UploadStatus::Error {
            if let Some(entry) = state.uploads.get_mut(id) {
                if let Ok(old) = entry.meta.mark_requeued_after_error() {
                    let snapshot = entry.meta.clone();
                    self.inner.announce(old, &snapshot);
                }
            }
        } else {
            self.inner.change_status(&mut state, id, UploadStatus::Queued);
        }
        state.queue.push_back(id.to_string());
        self.inner.pump(&mut state);
        Ok(())
    }

    /// 提交重复内容的处理决定
    pub async fn resolve_duplicate(
        &self,
        id: &str,
        decision: DuplicateDecision,
    ) -> Result<DecisionOutcome, SchedulerError> {
        let session = {
            let state = self.inner.state.lock();
            let entry = state
                .uploads
                .get(id)
                .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
            if entry.meta.status != UploadStatus::DuplicatePending {
                return Err(SchedulerError::InvalidState {
                    id: id.to_string(),
                    status: entry.meta.status,
                    action: "处理重复",
                });
            }
            entry
                .meta
                .session_handle
                .clone()
                .ok_or_else(|| SchedulerError::NoSession(id.to_string()))?
        };

        let outcome = self.inner.transport.resolve_duplicate(&session, decision).await?;
        info!("重复内容已处理: upload={}, decision={}", id, decision.as_str());

        let mut state = self.inner.state.lock();
        let Some(entry) = state.uploads.get_mut(id) else {
            return Ok(outcome);
        };
        if entry.meta.status != UploadStatus::DuplicatePending {
            return Ok(outcome);
        }
        let result = match (decision, outcome.video_id.clone()) {
            (DuplicateDecision::CancelUpload, _) | (_, None) => {
                entry.meta.transition(UploadStatus::Cancelled).map(|old| (old, None))
            }
            (_, Some(video_id)) => entry
                .meta
                .mark_complete(video_id.clone())
                .map(|old| (old, Some(video_id))),
        };
        if let Ok((old, video_id)) = result {
            let snapshot = entry.meta.clone();
            self.inner.announce(old, &snapshot);
            if let Some(video_id) = video_id {
                self.inner.emit(UploadEvent::Completed {
                    upload_id: id.to_string(),
                    video_id,
                });
            }
        }
        Ok(outcome)
    }

    /// 取消所有 pending / queued / stalled 的上传，不影响正在传输的上传
    pub fn stop_queued(&self) -> usize {
        let mut state = self.inner.state.lock();
        let targets: Vec<String> = state
            .order
            .iter()
            .filter(|id| {
                state.uploads.get(*id).is_some_and(|e| {
                    matches!(
                        e.meta.status,
                        UploadStatus::Pending | UploadStatus::Queued | UploadStatus::Stalled
                    )
                })
            })
            .cloned()
            .collect();

        let sessions = self.inner.cancel_all(&mut state, &targets);
        self.inner.pump(&mut state);
        drop(state);

        self.inner.terminate_sessions(sessions);
        info!("已取消 {} 个排队中的上传", targets.len());
        targets.len()
    }

    /// 中止全部上传
    ///
    /// 返回时所有传输 worker 已中止、槽位已释放；服务端会话在后台终止。
    /// duplicate_pending 与终态上传不受影响。
    pub fn abort_all(&self) -> usize {
        self.abort_targets().0
    }

    /// 中止全部上传，并等待服务端会话终止（最多 `timeout`）
    ///
    /// 进程即将退出时使用，后台任务来不及执行会留下服务端会话
    pub async fn abort_all_and_wait(&self, timeout: Duration) -> usize {
        let (aborted, terminating) = self.abort_targets();
        if let Some(handle) = terminating {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!("服务端会话已终止"),
                Ok(Err(e)) => warn!("终止服务端会话的任务异常: {}", e),
                Err(_) => warn!("等待服务端会话终止超时: {:?}", timeout),
            }
        }
        aborted
    }

    fn abort_targets(&self) -> (usize, Option<JoinHandle<()>>) {
        let mut state = self.inner.state.lock();
        let targets: Vec<String> = state
            .order
            .iter()
            .filter(|id| {
                state.uploads.get(*id).is_some_and(|e| {
                    !e.meta.status.is_terminal() && e.meta.status != UploadStatus::DuplicatePending
                })
            })
            .cloned()
            .collect();

        let sessions = self.inner.cancel_all(&mut state, &targets);
        state.queue.clear();
        drop(state);

        let terminating = self.inner.terminate_sessions(sessions);
        warn!("已中止 {} 个上传", targets.len());
        (targets.len(), terminating)
    }

    /// 从列表移除已结束的上传
    pub fn remove(&self, id: &str) -> Result<(), SchedulerError> {
        let mut state = self.inner.state.lock();
        let status = status_of(&state, id)?;
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidState {
                id: id.to_string(),
                status,
                action: "移除",
            });
        }
        let session = state
            .uploads
            .remove(id)
            .and_then(|e| e.meta.session_handle)
            .filter(|_| status == UploadStatus::Error);
        state.order.retain(|o| o != id);
        drop(state);

        if let Err(e) = self.inner.store.remove(id) {
            warn!("删除上传元数据失败: {}, 错误: {}", id, e);
        }
        self.inner.terminate_sessions(session.into_iter().collect());
        self.inner.emit(UploadEvent::Removed {
            upload_id: id.to_string(),
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<UploadMetadata> {
        self.inner.state.lock().uploads.get(id).map(|e| e.meta.clone())
    }

    /// 按加入顺序列出所有上传
    pub fn list(&self) -> Vec<UploadMetadata> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.uploads.get(id).map(|e| e.meta.clone()))
            .collect()
    }

    /// 占用槽位的上传数
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active_count()
    }

    pub fn aggregate(&self) -> AggregateStatus {
        let state = self.inner.state.lock();
        let mut agg = AggregateStatus::default();
        for entry in state.uploads.values() {
            let status = entry.meta.status;
            agg.total += 1;
            *agg.counts.entry(status).or_default() += 1;
            agg.bytes_uploaded += entry.meta.bytes_uploaded;
            agg.bytes_total += entry.meta.file_size;
            if status.holds_slot() {
                agg.active += 1;
            }
            match status {
                UploadStatus::Error => agg.any_error = true,
                UploadStatus::Stalled | UploadStatus::Retrying => agg.any_stalled = true,
                _ => {}
            }
        }
        agg
    }

    /// 所有上传都已结束或在等待用户操作
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.uploads.values().all(|e| {
            matches!(
                e.meta.status,
                UploadStatus::Complete
                    | UploadStatus::Cancelled
                    | UploadStatus::Error
                    | UploadStatus::Paused
                    | UploadStatus::DuplicatePending
            )
        })
    }

    /// 停止停滞检测循环（不影响已有上传）
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

fn status_of(state: &State, id: &str) -> Result<UploadStatus, SchedulerError> {
    state
        .uploads
        .get(id)
        .map(|e| e.meta.status)
        .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
}

impl Inner {
    fn emit(&self, event: UploadEvent) {
        // 接收端关闭时丢弃事件
        let _ = self.events.send(event);
    }

    fn persist(&self, meta: &UploadMetadata) {
        let result = match meta.status {
            UploadStatus::Complete | UploadStatus::Cancelled => self.store.remove(&meta.id).map(|_| ()),
            _ => self.store.save(meta),
        };
        if let Err(e) = result {
            warn!("持久化上传状态失败: {}, 错误: {}", meta.id, e);
        }
    }

    /// 状态变更后的统一出口：持久化 + 事件
    fn announce(&self, old: UploadStatus, meta: &UploadMetadata) {
        self.persist(meta);
        debug!("上传状态变更: {} {} -> {}", meta.id, old, meta.status);
        self.emit(UploadEvent::StatusChanged {
            upload_id: meta.id.clone(),
            old_status: old,
            new_status: meta.status,
        });
    }

    fn insert(&self, state: &mut State, meta: UploadMetadata) {
        self.emit(UploadEvent::Added {
            upload_id: meta.id.clone(),
            file_name: meta.file_name.clone(),
            relative_path: meta.relative_path.clone(),
            file_size: meta.file_size,
        });
        self.persist(&meta);
        state.order.push(meta.id.clone());
        state.uploads.insert(
            meta.id.clone(),
            UploadEntry {
                meta,
                throttler: ProgressThrottler::new(self.config.progress_interval),
            },
        );
    }

    fn change_status(&self, state: &mut State, id: &str, next: UploadStatus) -> bool {
        let Some(entry) = state.uploads.get_mut(id) else {
            return false;
        };
        match entry.meta.transition(next) {
            Ok(old) => {
                let snapshot = entry.meta.clone();
                self.announce(old, &snapshot);
                true
            }
            Err(e) => {
                error!("上传 {}: {}", id, e);
                false
            }
        }
    }

    fn fail(&self, state: &mut State, id: &str, message: String, kind: UploadErrorKind) {
        state.stall.untrack(id);
        let Some(entry) = state.uploads.get_mut(id) else {
            return;
        };
        if kind == UploadErrorKind::SessionExpired {
            // 会话已失效，下次重试需要新建会话
            entry.meta.session_handle = None;
            entry.meta.bytes_uploaded = 0;
        }
        if let Ok(old) = entry.meta.mark_error(message.clone()) {
            let snapshot = entry.meta.clone();
            self.announce(old, &snapshot);
            error!("上传失败: {} ({}): {}", snapshot.relative_path, id, message);
            self.emit(UploadEvent::Failed {
                upload_id: id.to_string(),
                error: message,
            });
        }
    }

    /// 把 queued 的上传晋升到空闲槽位
    fn pump(self: &Arc<Self>, state: &mut State) {
        while state.active_count() < self.config.concurrent_uploads {
            let Some(id) = state.queue.pop_front() else {
                break;
            };
            if state.uploads.get(&id).map(|e| e.meta.status) != Some(UploadStatus::Queued) {
                continue;
            }
            if self.change_status(state, &id, UploadStatus::Uploading) {
                state.stall.track(&id, Instant::now());
                self.spawn_worker(state, &id, None);
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut State, id: &str, delay: Option<Duration>) {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(self);
        let upload_id = id.to_string();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = inner.run_worker(upload_id, worker_id, delay) => {}
            }
        });

        if let Some(old) = state.workers.insert(
            id.to_string(),
            WorkerHandle {
                worker_id,
                cancel,
                handle,
            },
        ) {
            old.stop();
        }
    }

    async fn run_worker(self: &Arc<Self>, id: String, worker_id: u64, delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            if !self.begin_retry_attempt(&id, worker_id) {
                return;
            }
        }
        let result = self.transfer(&id, worker_id).await;
        self.on_worker_finished(&id, worker_id, result);
    }

    /// retrying -> uploading，重试次数 +1
    fn begin_retry_attempt(self: &Arc<Self>, id: &str, worker_id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.current_entry(id, worker_id) else {
            return false;
        };
        if entry.meta.status != UploadStatus::Retrying {
            return false;
        }
        entry.meta.retry_count += 1;
        let attempt = entry.meta.retry_count;
        if !self.change_status(&mut state, id, UploadStatus::Uploading) {
            return false;
        }
        state.stall.track(id, Instant::now());
        info!("开始第 {} 次重试: {}", attempt, id);
        true
    }

    /// 单个上传的传输过程
    async fn transfer(&self, id: &str, worker_id: u64) -> Result<FinalizeOutcome, WorkerError> {
        let meta = self.get_current(id, worker_id).ok_or(WorkerError::Superseded)?;

        let session = match meta.session_handle.clone() {
            Some(handle) => handle,
            None => {
                let handle = self.transport.open(&meta).await?;
                if !self.set_session(id, worker_id, &handle) {
                    return Err(WorkerError::Superseded);
                }
                handle
            }
        };

        // 服务端偏移量为准，缓存的 bytes_uploaded 只用于展示
        let mut offset = self.transport.query_offset(&session).await?;
        if offset != meta.bytes_uploaded {
            info!(
                "偏移量已按服务端校正: {} 缓存={} 服务端={}",
                id, meta.bytes_uploaded, offset
            );
        }
        if !self.record_offset(id, worker_id, offset, false) {
            return Err(WorkerError::Superseded);
        }

        let plan = ChunkPlan::new(meta.file_size, self.config.chunk_size);
        let mut conflicts = 0u32;

        while let Some(range) = plan.next_range(offset) {
            let data = read_range(&meta.local_path, range.clone())
                .await
                .map_err(|e| WorkerError::LocalIo(format!("{:#}", e)))?;

            match self.transport.append_chunk(&session, offset, data).await {
                Ok(new_offset) if new_offset > offset => {
                    conflicts = 0;
                    offset = new_offset.min(meta.file_size);
                    if !self.record_offset(id, worker_id, offset, true) {
                        return Err(WorkerError::Superseded);
                    }
                }
                Ok(new_offset) => {
                    return Err(TransportError::Protocol(format!(
                        "服务端偏移量未前进: {} -> {}",
                        offset, new_offset
                    ))
                    .into());
                }
                Err(TransportError::OffsetConflict { server_offset }) => {
                    conflicts += 1;
                    if conflicts > MAX_CONSECUTIVE_CONFLICTS {
                        return Err(TransportError::Protocol("偏移量反复冲突".to_string()).into());
                    }
                    // 不信任冲突响应里的偏移量，重新查询
                    offset = self.transport.query_offset(&session).await?;
                    warn!(
                        "偏移量冲突，已重新同步: {} 冲突响应={:?} 服务端={}",
                        id, server_offset, offset
                    );
                    if !self.record_offset(id, worker_id, offset, false) {
                        return Err(WorkerError::Superseded);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self.transport.finalize(&session).await?)
    }

    fn get_current(&self, id: &str, worker_id: u64) -> Option<UploadMetadata> {
        let mut state = self.state.lock();
        let entry = state.current_entry(id, worker_id)?;
        (entry.meta.status == UploadStatus::Uploading).then(|| entry.meta.clone())
    }

    fn set_session(&self, id: &str, worker_id: u64, handle: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.current_entry(id, worker_id) else {
            return false;
        };
        entry.meta.session_handle = Some(handle.to_string());
        let snapshot = entry.meta.clone();
        self.persist(&snapshot);
        true
    }

    /// 记录服务端确认的偏移量；`progressed` 为 true 时重置停滞计时
    fn record_offset(&self, id: &str, worker_id: u64, offset: u64, progressed: bool) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(entry) = state.current_entry(id, worker_id) else {
            return false;
        };
        if entry.meta.status != UploadStatus::Uploading {
            return false;
        }
        entry.meta.set_offset(offset);
        // 每个确认的分片都落盘，且在锁内完成，不会覆盖之后的取消或完成
        self.persist(&entry.meta);
        let complete = entry.meta.bytes_uploaded == entry.meta.file_size;
        let emit = if complete {
            entry.throttler.force_emit(now);
            true
        } else {
            entry.throttler.should_emit(now)
        };
        let snapshot = emit.then(|| entry.meta.clone());
        if progressed {
            state.stall.record_progress(id, now);
        }
        drop(state);

        if let Some(meta) = snapshot {
            self.emit(UploadEvent::Progress {
                upload_id: meta.id.clone(),
                bytes_uploaded: meta.bytes_uploaded,
                file_size: meta.file_size,
                progress: meta.progress(),
            });
        }
        true
    }

    fn on_worker_finished(
        self: &Arc<Self>,
        id: &str,
        worker_id: u64,
        result: Result<FinalizeOutcome, WorkerError>,
    ) {
        let mut state = self.state.lock();
        if state.current_entry(id, worker_id).is_none() {
            return;
        }
        state.workers.remove(id);
        if status_of(&state, id).ok() != Some(UploadStatus::Uploading) {
            return;
        }

        match result {
            Ok(FinalizeOutcome::Success { video_id }) => {
                state.stall.untrack(id);
                if let Some(entry) = state.uploads.get_mut(id) {
                    if let Ok(old) = entry.meta.mark_complete(video_id.clone()) {
                        let snapshot = entry.meta.clone();
                        self.announce(old, &snapshot);
                        info!("上传完成: {} -> video {}", snapshot.relative_path, video_id);
                        self.emit(UploadEvent::Completed {
                            upload_id: id.to_string(),
                            video_id,
                        });
                    }
                }
            }
            Ok(FinalizeOutcome::PendingDuplicate {
                duplicate_of_video_id,
                duplicate_of_display_path,
            }) => {
                state.stall.untrack(id);
                if let Some(entry) = state.uploads.get_mut(id) {
                    let info = DuplicateInfo {
                        duplicate_of_video_id: duplicate_of_video_id.clone(),
                        duplicate_of_display_path: duplicate_of_display_path.clone(),
                    };
                    if let Ok(old) = entry.meta.mark_duplicate_pending(info) {
                        let snapshot = entry.meta.clone();
                        self.announce(old, &snapshot);
                        info!(
                            "内容重复，等待决定: {} 与 {} ({}) 相同",
                            snapshot.relative_path, duplicate_of_display_path, duplicate_of_video_id
                        );
                        self.emit(UploadEvent::DuplicatePending {
                            upload_id: id.to_string(),
                            duplicate_of_video_id,
                            duplicate_of_display_path,
                        });
                    }
                }
            }
            Err(WorkerError::Superseded) => {}
            Err(e) => {
                let kind = e.kind();
                let retry_count = state.uploads.get(id).map_or(0, |e| e.meta.retry_count);
                match self.retry.decide(retry_count, kind) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!("上传出错，{:?} 后重试: {}: {}", delay, id, e);
                        self.schedule_retry(&mut state, id, delay);
                    }
                    RetryDecision::Resync => self.spawn_worker(&mut state, id, None),
                    RetryDecision::GiveUp => self.fail(&mut state, id, e.to_string(), kind),
                }
            }
        }

        self.pump(&mut state);
    }

    /// uploading/stalled -> retrying，并安排延迟 worker
    fn schedule_retry(self: &Arc<Self>, state: &mut State, id: &str, delay: Duration) {
        state.stall.untrack(id);
        if !self.change_status(state, id, UploadStatus::Retrying) {
            return;
        }
        let attempt = state.uploads.get(id).map_or(0, |e| e.meta.retry_count) + 1;
        self.emit(UploadEvent::Retrying {
            upload_id: id.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        self.spawn_worker(state, id, Some(delay));
    }

    fn check_stalls(self: &Arc<Self>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let stalled = state.stall.stalled(now);
        if stalled.is_empty() {
            return;
        }

        for id in stalled {
            state.stall.untrack(&id);
            if status_of(&state, &id).ok() != Some(UploadStatus::Uploading) {
                continue;
            }
            state.stop_worker(&id);
            warn!("上传停滞超过 {:?}: {}", self.config.stall_timeout, id);
            if !self.change_status(&mut state, &id, UploadStatus::Stalled) {
                continue;
            }

            let retry_count = state.uploads.get(&id).map_or(0, |e| e.meta.retry_count);
            match self.retry.decide(retry_count, UploadErrorKind::Stalled) {
                RetryDecision::RetryAfter(delay) => self.schedule_retry(&mut state, &id, delay),
                _ => self.fail(
                    &mut state,
                    &id,
                    format!("上传停滞超时，已重试 {} 次", retry_count),
                    UploadErrorKind::Stalled,
                ),
            }
        }

        self.pump(&mut state);
    }

    /// 取消指定上传，返回需要在服务端终止的会话
    fn cancel_all(&self, state: &mut State, ids: &[String]) -> Vec<String> {
        let mut sessions = Vec::new();
        for id in ids {
            state.stop_worker(id);
            state.stall.untrack(id);
            state.queue.retain(|q| q != id);
            if self.change_status(state, id, UploadStatus::Cancelled) {
                if let Some(session) = state
                    .uploads
                    .get(id)
                    .and_then(|e| e.meta.session_handle.clone())
                {
                    sessions.push(session);
                }
            }
        }
        sessions
    }

    /// 在后台终止服务端会话，返回的句柄可用于等待完成
    fn terminate_sessions(&self, sessions: Vec<String>) -> Option<JoinHandle<()>> {
        if sessions.is_empty() {
            return None;
        }
        let transport = Arc::clone(&self.transport);
        Some(tokio::spawn(async move {
            for session in sessions {
                if let Err(e) = transport.terminate(&session).await {
                    warn!("终止上传会话失败: {}, 错误: {}", session, e);
                }
            }
        }))
    }
}

fn spawn_stall_loop(inner: Weak<Inner>, shutdown: CancellationToken, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.check_stalls();
        }
        debug!("停滞检测循环已退出");
    });
}
