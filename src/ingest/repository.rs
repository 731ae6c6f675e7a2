//! 视频元数据 SQLite 仓库
//!
//! - videos: 已入库的视频（软删除）
//! - duplicate_resolutions: 内容重复时的待决记录
//! - processing_jobs: 后台处理任务

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::processing::PipelineKind;
use crate::protocol::DuplicateDecision;

/// 视频处理状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// 已入库，尚未提交处理
    Pending,
    Queued,
    Running,
    Complete,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Running => "running",
            ProcessingStatus::Complete => "complete",
            ProcessingStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "queued" => Some(ProcessingStatus::Queued),
            "running" => Some(ProcessingStatus::Running),
            "complete" => Some(ProcessingStatus::Complete),
            "error" => Some(ProcessingStatus::Error),
            _ => None,
        }
    }
}

/// 处理任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// 视频记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: String,
    /// 产生该视频的上传会话
    pub session_id: Option<String>,
    pub file_name: String,
    /// 展示路径（上传时的相对路径）
    pub display_path: String,
    /// SHA-256（十六进制）
    pub content_hash: String,
    pub file_size: u64,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    pub processing_status: ProcessingStatus,
    pub processing_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_error: Option<String>,
}

impl VideoRecord {
    pub fn new(
        id: String,
        session_id: Option<String>,
        file_name: String,
        display_path: String,
        content_hash: String,
        file_size: u64,
    ) -> Self {
        Self {
            id,
            session_id,
            file_name,
            display_path,
            content_hash,
            file_size,
            created_at: chrono::Utc::now().timestamp_millis(),
            deleted_at: None,
            processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
            processing_error: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// 内容重复待决记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateResolution {
    pub session_id: String,
    pub content_hash: String,
    pub duplicate_of_video_id: String,
    pub duplicate_of_display_path: String,
    pub user_decision: Option<DuplicateDecision>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

/// 处理任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub video_id: String,
    pub pipeline_kind: PipelineKind,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    /// 提交任务的服务实例
    #[serde(default)]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl JobRecord {
    pub fn new(
        video_id: String,
        pipeline_kind: PipelineKind,
        parameters: serde_json::Value,
        instance_id: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            video_id,
            pipeline_kind,
            parameters,
            status: JobStatus::Queued,
            instance_id: instance_id.to_string(),
            error: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// 视频仓库
pub struct VideoRepository {
    conn: Mutex<Connection>,
}

const VIDEO_COLUMNS: &str = "id, session_id, file_name, display_path, content_hash, file_size, \
     created_at, deleted_at, processing_status, processing_attempts, processing_error";

const JOB_COLUMNS: &str = "id, video_id, pipeline_kind, parameters, status, error, created_at, \
     started_at, finished_at, instance_id";

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl VideoRepository {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("打开数据库失败: {:?}", db_path))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // 多进程共享同一数据库时等待写锁
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_tables()?;
        Ok(repo)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS videos (
                id TEXT PRIMARY KEY,
                session_id TEXT UNIQUE,
                file_name TEXT NOT NULL,
                display_path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER,
                processing_status TEXT NOT NULL DEFAULT 'pending',
                processing_attempts INTEGER NOT NULL DEFAULT 0,
                processing_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_videos_hash ON videos(content_hash, deleted_at);
            CREATE INDEX IF NOT EXISTS idx_videos_path ON videos(display_path, deleted_at);

            CREATE TABLE IF NOT EXISTS duplicate_resolutions (
                session_id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                duplicate_of_video_id TEXT NOT NULL,
                duplicate_of_display_path TEXT NOT NULL,
                user_decision TEXT,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS processing_jobs (
                id TEXT PRIMARY KEY,
                video_id TEXT NOT NULL,
                pipeline_kind TEXT NOT NULL,
                parameters TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                instance_id TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_video ON processing_jobs(video_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON processing_jobs(status);
            "#,
        )?;

        // 旧库没有 instance_id 列
        let has_instance: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('processing_jobs') WHERE name = 'instance_id'",
            [],
            |r| r.get(0),
        )?;
        if !has_instance {
            conn.execute(
                "ALTER TABLE processing_jobs ADD COLUMN instance_id TEXT NOT NULL DEFAULT ''",
                [],
            )?;
            info!("processing_jobs 已添加 instance_id 列");
        }
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_instance ON processing_jobs(instance_id, status)",
            [],
        )?;

        info!("视频数据库表初始化完成");
        Ok(())
    }

    // ========================================================================
    // videos
    // ========================================================================

    pub fn insert_video(&self, video: &VideoRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO videos (
                id, session_id, file_name, display_path, content_hash, file_size,
                created_at, deleted_at, processing_status, processing_attempts, processing_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                video.id,
                video.session_id,
                video.file_name,
                video.display_path,
                video.content_hash,
                video.file_size as i64,
                video.created_at,
                video.deleted_at,
                video.processing_status.as_str(),
                video.processing_attempts,
                video.processing_error,
            ],
        )?;
        debug!("视频记录已写入: {} ({})", video.id, video.display_path);
        Ok(())
    }

    pub fn get_video(&self, id: &str) -> Result<Option<VideoRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM videos WHERE id = ?1", VIDEO_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_video).optional()?)
    }

    /// 由指定会话生成的视频
    pub fn find_by_session(&self, session_id: &str) -> Result<Option<VideoRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM videos WHERE session_id = ?1", VIDEO_COLUMNS);
        Ok(conn.query_row(&sql, params![session_id], row_to_video).optional()?)
    }

    /// 未删除且内容哈希相同的最早视频
    pub fn find_active_by_hash(&self, content_hash: &str) -> Result<Option<VideoRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM videos WHERE content_hash = ?1 AND deleted_at IS NULL \
             ORDER BY created_at ASC LIMIT 1",
            VIDEO_COLUMNS
        );
        Ok(conn.query_row(&sql, params![content_hash], row_to_video).optional()?)
    }

    /// 未删除且展示路径相同的视频
    pub fn find_active_by_path(&self, display_path: &str) -> Result<Option<VideoRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM videos WHERE display_path = ?1 AND deleted_at IS NULL \
             ORDER BY created_at ASC LIMIT 1",
            VIDEO_COLUMNS
        );
        Ok(conn.query_row(&sql, params![display_path], row_to_video).optional()?)
    }

    /// 软删除，返回是否有记录被删除
    pub fn soft_delete_video(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE videos SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id, now_millis()],
        )?;
        Ok(n == 1)
    }

    pub fn set_processing_status(
        &self,
        video_id: &str,
        status: ProcessingStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE videos SET processing_status = ?2, processing_error = ?3 WHERE id = ?1",
            params![video_id, status.as_str(), error],
        )?;
        Ok(())
    }

    /// error -> queued，尝试次数 +1
    ///
    /// 仅当视频当前处于 error 时生效，返回是否生效
    pub fn reset_processing_error(&self, video_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            r#"
            UPDATE videos
            SET processing_status = 'queued',
                processing_attempts = processing_attempts + 1,
                processing_error = NULL
            WHERE id = ?1 AND processing_status = 'error' AND deleted_at IS NULL
            "#,
            params![video_id],
        )?;
        Ok(n == 1)
    }

    // ========================================================================
    // duplicate_resolutions
    // ========================================================================

    /// 写入待决记录；同一会话只会写入一次
    pub fn insert_resolution(&self, resolution: &DuplicateResolution) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            r#"
            INSERT OR IGNORE INTO duplicate_resolutions (
                session_id, content_hash, duplicate_of_video_id, duplicate_of_display_path,
                user_decision, created_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL)
            "#,
            params![
                resolution.session_id,
                resolution.content_hash,
                resolution.duplicate_of_video_id,
                resolution.duplicate_of_display_path,
                resolution.created_at,
            ],
        )?;
        Ok(n == 1)
    }

    pub fn get_resolution(&self, session_id: &str) -> Result<Option<DuplicateResolution>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                r#"
                SELECT session_id, content_hash, duplicate_of_video_id, duplicate_of_display_path,
                       user_decision, created_at, resolved_at
                FROM duplicate_resolutions WHERE session_id = ?1
                "#,
                params![session_id],
                row_to_resolution,
            )
            .optional()?)
    }

    /// 认领决定：只有 user_decision 仍为空时才写入，返回是否认领成功
    pub fn claim_resolution(&self, session_id: &str, decision: DuplicateDecision) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            r#"
            UPDATE duplicate_resolutions
            SET user_decision = ?2, resolved_at = ?3
            WHERE session_id = ?1 AND user_decision IS NULL
            "#,
            params![session_id, decision.as_str(), now_millis()],
        )?;
        Ok(n == 1)
    }

    /// 撤回认领：只有决定仍是 decision 时才清空
    pub fn unclaim_resolution(&self, session_id: &str, decision: DuplicateDecision) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            r#"
            UPDATE duplicate_resolutions
            SET user_decision = NULL, resolved_at = NULL
            WHERE session_id = ?1 AND user_decision = ?2
            "#,
            params![session_id, decision.as_str()],
        )?;
        Ok(n == 1)
    }

    pub fn delete_resolution(&self, session_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM duplicate_resolutions WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(n == 1)
    }

    // ========================================================================
    // processing_jobs
    // ========================================================================

    pub fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO processing_jobs (
                id, video_id, pipeline_kind, parameters, status, error,
                created_at, started_at, finished_at, instance_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                job.id,
                job.video_id,
                job.pipeline_kind.as_str(),
                serde_json::to_string(&job.parameters)?,
                job.status.as_str(),
                job.error,
                job.created_at,
                job.started_at,
                job.finished_at,
                job.instance_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM processing_jobs WHERE id = ?1", JOB_COLUMNS);
        Ok(conn.query_row(&sql, params![id], row_to_job).optional()?)
    }

    pub fn latest_job_for_video(&self, video_id: &str) -> Result<Option<JobRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM processing_jobs WHERE video_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            JOB_COLUMNS
        );
        Ok(conn.query_row(&sql, params![video_id], row_to_job).optional()?)
    }

    pub fn mark_job_running(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE processing_jobs SET status = 'running', started_at = ?2 WHERE id = ?1",
            params![id, now_millis()],
        )?;
        Ok(())
    }

    pub fn mark_job_finished(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE processing_jobs SET status = ?2, error = ?3, finished_at = ?4 WHERE id = ?1",
            params![id, status.as_str(), error, now_millis()],
        )?;
        Ok(())
    }

    /// 把本实例上次运行遗留的 queued / running 任务标记为失败，返回受影响的任务
    ///
    /// 其他实例的任务可能仍在运行，不做处理
    pub fn fail_interrupted_jobs(&self, instance_id: &str, reason: &str) -> Result<Vec<JobRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let jobs = {
            let sql = format!(
                "SELECT {} FROM processing_jobs WHERE instance_id = ?1 AND status IN ('queued', 'running')",
                JOB_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![instance_id], row_to_job)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let now = now_millis();
        for job in &jobs {
            tx.execute(
                "UPDATE processing_jobs SET status = 'failed', error = ?2, finished_at = ?3 WHERE id = ?1",
                params![job.id, reason, now],
            )?;
            tx.execute(
                "UPDATE videos SET processing_status = 'error', processing_error = ?2 WHERE id = ?1",
                params![job.video_id, reason],
            )?;
        }
        tx.commit()?;
        Ok(jobs)
    }
}

fn row_to_video(row: &Row<'_>) -> rusqlite::Result<VideoRecord> {
    let status: String = row.get(8)?;
    Ok(VideoRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        file_name: row.get(2)?,
        display_path: row.get(3)?,
        content_hash: row.get(4)?,
        file_size: row.get::<_, i64>(5)? as u64,
        created_at: row.get(6)?,
        deleted_at: row.get(7)?,
        processing_status: ProcessingStatus::parse(&status).unwrap_or(ProcessingStatus::Error),
        processing_attempts: row.get(9)?,
        processing_error: row.get(10)?,
    })
}

fn row_to_resolution(row: &Row<'_>) -> rusqlite::Result<DuplicateResolution> {
    let decision: Option<String> = row.get(4)?;
    Ok(DuplicateResolution {
        session_id: row.get(0)?,
        content_hash: row.get(1)?,
        duplicate_of_video_id: row.get(2)?,
        duplicate_of_display_path: row.get(3)?,
        user_decision: decision.as_deref().and_then(DuplicateDecision::parse),
        created_at: row.get(5)?,
        resolved_at: row.get(6)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let kind: String = row.get(2)?;
    let parameters: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(JobRecord {
        id: row.get(0)?,
        video_id: row.get(1)?,
        pipeline_kind: PipelineKind::parse(&kind).unwrap_or_default(),
        parameters: serde_json::from_str(&parameters).unwrap_or(serde_json::Value::Null),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        instance_id: row.get(9)?,
        error: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        finished_at: row.get(8)?,
    })
}
