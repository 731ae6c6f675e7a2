//! 处理准入控制
//!
//! 全局并发上限 `max_total_concurrent_processing`，与流水线类型无关。
//! 进程内先经过 FIFO 信号量排队，再向槽位计数器登记；许可在 Drop 时
//! 释放，任务无论以何种方式退出（完成、失败、panic、被看门狗中止）
//! 都会归还槽位。

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::counter::SlotCounter;
use super::PipelineKind;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("准入控制器已关闭")]
    Closed,
    #[error(transparent)]
    Counter(#[from] anyhow::Error),
}

/// 持有槽位期间存在的凭据，不落盘
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionTicket {
    pub pipeline_kind: PipelineKind,
    pub video_id: String,
    /// 获得槽位的时间（毫秒时间戳）
    pub acquired_at: i64,
}

/// 准入状态快照
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub max: usize,
    pub running: Vec<AdmissionTicket>,
    pub waiting: usize,
}

struct Inner {
    max: usize,
    local: Arc<Semaphore>,
    counter: Arc<dyn SlotCounter>,
    counter_poll: Duration,
    waiting: AtomicUsize,
    next_id: AtomicU64,
    holder_prefix: String,
    tickets: Mutex<BTreeMap<u64, AdmissionTicket>>,
}

/// 全局处理准入控制器
#[derive(Clone)]
pub struct ProcessingAdmissionController {
    inner: Arc<Inner>,
}

impl ProcessingAdmissionController {
    pub fn new(max: usize, counter: Arc<dyn SlotCounter>, counter_poll: Duration) -> Self {
        let max = max.max(1);
        info!("处理准入控制器已创建: 全局并发上限={}", max);
        Self {
            inner: Arc::new(Inner {
                max,
                local: Arc::new(Semaphore::new(max)),
                counter,
                counter_poll,
                waiting: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                holder_prefix: uuid::Uuid::new_v4().to_string(),
                tickets: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    /// 等待一个空闲槽位
    ///
    /// 同一进程内按调用顺序（FIFO）获得槽位。外部计数器已满时按
    /// `counter_poll` 间隔轮询。
    pub async fn acquire(
        &self,
        pipeline_kind: PipelineKind,
        video_id: &str,
    ) -> Result<AdmissionPermit, AdmissionError> {
        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&self.inner.waiting);

        let local = self
            .inner
            .local
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let holder = format!("{}-{}", self.inner.holder_prefix, id);
        while !self.inner.counter.try_acquire(&holder, self.inner.max)? {
            debug!("外部槽位已满，等待: {}", holder);
            tokio::time::sleep(self.inner.counter_poll).await;
        }

        let ticket = AdmissionTicket {
            pipeline_kind,
            video_id: video_id.to_string(),
            acquired_at: chrono::Utc::now().timestamp_millis(),
        };
        self.inner.tickets.lock().insert(id, ticket);
        debug!("获得处理槽位: {} video={} kind={}", id, video_id, pipeline_kind);

        Ok(AdmissionPermit {
            inner: Arc::clone(&self.inner),
            id,
            holder,
            _local: local,
        })
    }

    /// 占用槽位的任务数
    pub fn running_count(&self) -> usize {
        self.inner.tickets.lock().len()
    }

    /// 排队等待槽位的任务数
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            max: self.inner.max,
            running: self.inner.tickets.lock().values().cloned().collect(),
            waiting: self.waiting(),
        }
    }

    /// 停止接收新的准入请求，排队中的请求返回 `Closed`
    pub fn close(&self) {
        self.inner.local.close();
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 处理槽位许可，Drop 时释放
pub struct AdmissionPermit {
    inner: Arc<Inner>,
    id: u64,
    holder: String,
    _local: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn ticket(&self) -> Option<AdmissionTicket> {
        self.inner.tickets.lock().get(&self.id).cloned()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.inner.tickets.lock().remove(&self.id);
        if let Err(e) = self.inner.counter.release(&self.holder) {
            warn!("释放外部处理槽位失败: {}, 错误: {}", self.holder, e);
        }
        debug!("释放处理槽位: {}", self.id);
        // _local 随后释放，唤醒下一个排队者
    }
}
