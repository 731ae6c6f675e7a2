// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use error::{ApiError, ApiResult};
pub use state::AppState;

const BODY_LIMIT_HEADROOM: usize = 1024 * 1024;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "video-ingest-rust".to_string(),
    })
}

/// 构建完整路由
pub fn build_router(app_state: AppState) -> Router {
    // PATCH 分片可能超过 axum 默认的 2MB 请求体上限；超出 max_chunk_size 的分片由会话层返回 413
    let body_limit = usize::try_from(app_state.config.storage.max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_HEADROOM);

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        );

    let api_routes = Router::new()
        // 上传会话
        .route("/uploads", post(handlers::create_upload))
        .route(
            "/uploads/:id",
            axum::routing::head(handlers::upload_offset)
                .patch(handlers::append_chunk)
                .delete(handlers::terminate_upload),
        )
        .route("/uploads/:id/finalize", post(handlers::finalize_upload))
        .route(
            "/uploads/:id/duplicate-decision",
            post(handlers::duplicate_decision),
        )
        // 视频
        .route("/videos/exists", get(handlers::video_exists))
        .route("/videos/:id", get(handlers::get_video))
        .route("/videos/:id/retry", post(handlers::retry_video))
        // 处理任务
        .route("/processing/jobs", post(handlers::enqueue_job))
        .route("/processing/jobs/:id", get(handlers::get_job))
        .route("/processing/status", get(handlers::processing_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::events::UploadEvent;
    use crate::persistence::PersistentUploadStore;
    use crate::processing::{PipelineExecutor, PipelineJob};
    use crate::protocol::{DuplicateDecision, FinalizeOutcome};
    use crate::uploader::{
        HttpResumableTransport, ResumableTransport, SchedulerConfig, TransportError,
        UploadMetadata, UploadScheduler, UploadStatus,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    const CHUNK: u64 = 64 * 1024;

    struct NoopExecutor;

    #[async_trait]
    impl PipelineExecutor for NoopExecutor {
        async fn run(&self, _job: &PipelineJob) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct TestServer {
        endpoint: String,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    async fn start_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().join("data");
        config.storage.database_path = dir.path().join("data/videos.db");
        config.storage.max_chunk_size = 4 * CHUNK;

        let state = AppState::with_executor(config, Arc::new(NoopExecutor))
            .await
            .unwrap();
        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        TestServer {
            endpoint: format!("http://{}", addr),
            state,
            _dir: dir,
        }
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> UploadMetadata {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        UploadMetadata::new(path, format!("trip/{}", name), content.len() as u64)
    }

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            concurrent_uploads: 2,
            retry_delays_ms: vec![0],
            max_retries: 1,
            chunk_size: CHUNK,
            ..SchedulerConfig::default()
        }
    }

    async fn wait_for(scheduler: &UploadScheduler, id: &str, status: UploadStatus) -> UploadMetadata {
        for _ in 0..2000 {
            if let Some(meta) = scheduler.get(id) {
                if meta.status == status {
                    return meta;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("upload {} never reached {:?}: {:?}", id, status, scheduler.get(id));
    }

    #[tokio::test]
    async fn test_health() {
        let server = start_server().await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", server.endpoint))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_transport_against_server() {
        let server = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let transport = HttpResumableTransport::new(&server.endpoint, Duration::from_secs(10)).unwrap();

        let data = content((CHUNK * 2 + 100) as usize, 1);
        let meta = write_file(dir.path(), "a.mp4", &data);
        let session = transport.open(&meta).await.unwrap();
        assert_eq!(transport.query_offset(&session).await.unwrap(), 0);

        let first = transport
            .append_chunk(&session, 0, data[..CHUNK as usize].to_vec())
            .await
            .unwrap();
        assert_eq!(first, CHUNK);

        // 偏移量不一致时返回服务端偏移量
        let err = transport
            .append_chunk(&session, 0, data[..CHUNK as usize].to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::OffsetConflict { server_offset: Some(CHUNK) });

        let offset = transport.query_offset(&session).await.unwrap();
        transport
            .append_chunk(&session, offset, data[offset as usize..].to_vec())
            .await
            .unwrap();

        let outcome = transport.finalize(&session).await.unwrap();
        let FinalizeOutcome::Success { video_id } = outcome.clone() else {
            panic!("unexpected outcome {:?}", outcome);
        };
        // 重复调用返回相同结论
        assert_eq!(transport.finalize(&session).await.unwrap(), outcome);

        let stored = server.state.ingest.storage().video_dir(&video_id).join("a.mp4");
        assert_eq!(std::fs::read(stored).unwrap(), data);
        assert!(transport.exists_by_path("trip/a.mp4").await.unwrap());
        assert!(!transport.exists_by_path("trip/b.mp4").await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_chunk_rejected() {
        let server = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let transport = HttpResumableTransport::new(&server.endpoint, Duration::from_secs(10)).unwrap();

        let data = content((CHUNK * 6) as usize, 2);
        let meta = write_file(dir.path(), "big.mp4", &data);
        let session = transport.open(&meta).await.unwrap();
        let err = transport
            .append_chunk(&session, 0, data[..(CHUNK * 5) as usize].to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::PayloadTooLarge);
        assert_eq!(transport.query_offset(&session).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminate_session() {
        let server = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let transport = HttpResumableTransport::new(&server.endpoint, Duration::from_secs(10)).unwrap();

        let meta = write_file(dir.path(), "gone.mp4", &content(100, 3));
        let session = transport.open(&meta).await.unwrap();
        transport.terminate(&session).await.unwrap();
        assert_eq!(
            transport.query_offset(&session).await.unwrap_err(),
            TransportError::SessionExpired
        );
        // 再次终止视为成功
        transport.terminate(&session).await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_duplicate_flow_end_to_end() {
        let server = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let transport: Arc<dyn ResumableTransport> = Arc::new(
            HttpResumableTransport::new(&server.endpoint, Duration::from_secs(10)).unwrap(),
        );
        let (scheduler, mut rx) = UploadScheduler::new(
            scheduler_config(),
            transport,
            PersistentUploadStore::disabled(),
        );

        let data = content((CHUNK * 3) as usize, 7);
        let original = scheduler.enqueue(write_file(dir.path(), "one.mp4", &data)).unwrap();
        let original = wait_for(&scheduler, &original, UploadStatus::Complete).await;
        let original_video = original.video_id.clone().unwrap();

        // 相同内容，不同文件名
        let copy = scheduler.enqueue(write_file(dir.path(), "two.mp4", &data)).unwrap();
        let pending = wait_for(&scheduler, &copy, UploadStatus::DuplicatePending).await;
        let dup = pending.duplicate.unwrap();
        assert_eq!(dup.duplicate_of_video_id, original_video);
        assert_eq!(dup.duplicate_of_display_path, "trip/one.mp4");

        let outcome = scheduler
            .resolve_duplicate(&copy, DuplicateDecision::ReplaceExisting)
            .await
            .unwrap();
        let new_video = outcome.video_id.unwrap();
        assert_ne!(new_video, original_video);
        wait_for(&scheduler, &copy, UploadStatus::Complete).await;

        let old = server.state.ingest.get_video(&original_video).unwrap().unwrap();
        assert!(old.is_deleted());
        assert!(!server.state.ingest.storage().video_dir(&original_video).exists());

        let mut saw_duplicate_event = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, UploadEvent::DuplicatePending { .. }) {
                saw_duplicate_event = true;
            }
        }
        assert!(saw_duplicate_event);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_second_decision_conflicts() {
        let server = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        let transport = HttpResumableTransport::new(&server.endpoint, Duration::from_secs(10)).unwrap();

        let data = content(1000, 9);
        for name in ["x.mp4", "y.mp4"] {
            let meta = write_file(dir.path(), name, &data);
            let session = transport.open(&meta).await.unwrap();
            transport.append_chunk(&session, 0, data.clone()).await.unwrap();
            let outcome = transport.finalize(&session).await.unwrap();
            if name == "x.mp4" {
                assert!(matches!(outcome, FinalizeOutcome::Success { .. }));
                continue;
            }
            assert!(matches!(outcome, FinalizeOutcome::PendingDuplicate { .. }));
            let first = transport
                .resolve_duplicate(&session, DuplicateDecision::KeepBoth)
                .await
                .unwrap();
            assert!(first.video_id.is_some());
            let second = transport
                .resolve_duplicate(&session, DuplicateDecision::KeepBoth)
                .await
                .unwrap_err();
            assert!(matches!(second, TransportError::Rejected { status: 409, .. }));
        }
    }

    #[tokio::test]
    async fn test_processing_routes() {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let api = format!("{}/api/v1", server.endpoint);

        let resp = client
            .post(format!("{}/processing/jobs", api))
            .json(&serde_json::json!({ "video_id": "missing" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let status: serde_json::Value = client
            .get(format!("{}/processing/status", api))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["code"], 0);
        assert_eq!(status["data"]["max"], 2);

        let resp = client
            .post(format!("{}/videos/missing/retry", api))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
