// 测试用的内存传输层，支持按文件名注入故障

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

use crate::protocol::{DecisionOutcome, DuplicateDecision, FinalizeOutcome};
use crate::uploader::task::UploadMetadata;
use crate::uploader::transport::{ResumableTransport, TransportError};

/// 单次追加请求上的故障
#[derive(Debug, Clone)]
pub enum Fault {
    /// 服务端写入后连接断开
    DropAfterWrite,
    /// 请求未到达服务端
    DropBeforeWrite,
    /// 服务端只落盘了前 n 字节并返回偏移量冲突
    ServerAhead(u64),
    /// 请求永远不返回
    Hang,
    Fail(TransportError),
}

struct Session {
    name: String,
    size: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    sessions: HashMap<String, Session>,
    faults: HashMap<String, VecDeque<Option<Fault>>>,
    offsets: HashMap<String, Vec<u64>>,
    duplicates: HashMap<String, (String, String)>,
    decided: HashSet<String>,
    terminated: Vec<String>,
    opened: usize,
    appended: u64,
    next_id: u64,
}

enum Action {
    Reply(Result<u64, TransportError>),
    Hang,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    gate: Option<Semaphore>,
    waiting: AtomicUsize,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            gate: None,
            waiting: AtomicUsize::new(0),
        }
    }

    /// 每次追加都要等待 `release` 放行
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// 阻塞在闸门上的追加请求数
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn inject(&self, name: &str, faults: Vec<Option<Fault>>) {
        self.state
            .lock()
            .faults
            .insert(name.to_string(), faults.into_iter().collect());
    }

    pub fn mark_duplicate(&self, name: &str, video_id: &str, display_path: &str) {
        self.state.lock().duplicates.insert(
            name.to_string(),
            (video_id.to_string(), display_path.to_string()),
        );
    }

    /// 预置一个已上传 `offset` 字节的会话
    pub fn seed_session(&self, name: &str, content: &[u8], offset: u64) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let handle = format!("seeded-{}", state.next_id);
        state.sessions.insert(
            handle.clone(),
            Session {
                name: name.to_string(),
                size: content.len() as u64,
                data: content[..offset as usize].to_vec(),
            },
        );
        handle
    }

    pub fn session_data(&self, name: &str) -> Vec<u8> {
        self.state
            .lock()
            .sessions
            .values()
            .find(|s| s.name == name)
            .map(|s| s.data.clone())
            .unwrap_or_default()
    }

    pub fn appended_offsets(&self, name: &str) -> Vec<u64> {
        self.state.lock().offsets.get(name).cloned().unwrap_or_default()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn total_appended(&self) -> u64 {
        self.state.lock().appended
    }

    pub fn terminated(&self) -> Vec<String> {
        self.state.lock().terminated.clone()
    }

    async fn pass_gate(&self) {
        let Some(gate) = &self.gate else {
            return;
        };
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitGuard(&self.waiting);
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        }
    }
}

#[async_trait]
impl ResumableTransport for MockTransport {
    async fn open(&self, meta: &UploadMetadata) -> Result<String, TransportError> {
        let mut state = self.state.lock();
        state.opened += 1;
        state.next_id += 1;
        let handle = format!("session-{}", state.next_id);
        state.sessions.insert(
            handle.clone(),
            Session {
                name: meta.file_name.clone(),
                size: meta.file_size,
                data: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn append_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<u64, TransportError> {
        self.pass_gate().await;

        let action = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(s) = state.sessions.get_mut(session) else {
                return Err(TransportError::SessionExpired);
            };
            state.offsets.entry(s.name.clone()).or_default().push(offset);

            let current = s.data.len() as u64;
            if offset != current {
                Action::Reply(Err(TransportError::OffsetConflict {
                    server_offset: Some(current),
                }))
            } else {
                let fault = state
                    .faults
                    .get_mut(&s.name)
                    .and_then(|q| q.pop_front())
                    .flatten();
                match fault {
                    None => {
                        s.data.extend_from_slice(&data);
                        state.appended += data.len() as u64;
                        Action::Reply(Ok(s.data.len() as u64))
                    }
                    Some(Fault::DropAfterWrite) => {
                        s.data.extend_from_slice(&data);
                        state.appended += data.len() as u64;
                        Action::Reply(Err(TransportError::Network("connection reset".into())))
                    }
                    Some(Fault::DropBeforeWrite) => {
                        Action::Reply(Err(TransportError::Network("connection refused".into())))
                    }
                    Some(Fault::ServerAhead(n)) => {
                        let n = (n as usize).min(data.len());
                        s.data.extend_from_slice(&data[..n]);
                        state.appended += n as u64;
                        Action::Reply(Err(TransportError::OffsetConflict {
                            server_offset: Some(s.data.len() as u64),
                        }))
                    }
                    Some(Fault::Hang) => Action::Hang,
                    Some(Fault::Fail(e)) => Action::Reply(Err(e)),
                }
            }
        };

        match action {
            Action::Reply(result) => result,
            Action::Hang => std::future::pending().await,
        }
    }

    async fn query_offset(&self, session: &str) -> Result<u64, TransportError> {
        self.state
            .lock()
            .sessions
            .get(session)
            .map(|s| s.data.len() as u64)
            .ok_or(TransportError::SessionExpired)
    }

    async fn finalize(&self, session: &str) -> Result<FinalizeOutcome, TransportError> {
        let state = self.state.lock();
        let s = state
            .sessions
            .get(session)
            .ok_or(TransportError::SessionExpired)?;
        if s.data.len() as u64 != s.size {
            return Err(TransportError::Protocol("upload incomplete".into()));
        }
        Ok(match state.duplicates.get(&s.name) {
            Some((video_id, path)) => FinalizeOutcome::PendingDuplicate {
                duplicate_of_video_id: video_id.clone(),
                duplicate_of_display_path: path.clone(),
            },
            None => FinalizeOutcome::Success {
                video_id: format!("video-{}", session),
            },
        })
    }

    async fn resolve_duplicate(
        &self,
        session: &str,
        decision: DuplicateDecision,
    ) -> Result<DecisionOutcome, TransportError> {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(session) {
            return Err(TransportError::SessionExpired);
        }
        if !state.decided.insert(session.to_string()) {
            return Err(TransportError::Rejected {
                status: 409,
                message: "already decided".into(),
            });
        }
        let video_id = match decision {
            DuplicateDecision::CancelUpload => None,
            _ => Some(format!("video-{}", session)),
        };
        Ok(DecisionOutcome { decision, video_id })
    }

    async fn terminate(&self, session: &str) -> Result<(), TransportError> {
        self.state.lock().terminated.push(session.to_string());
        Ok(())
    }
}
