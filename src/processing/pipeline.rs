// 流水线执行器

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::PipelineKind;
use crate::config::PipelineCommand;

/// 一次待执行的处理任务
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub job_id: String,
    pub video_id: String,
    pub kind: PipelineKind,
    /// 视频存储目录
    pub video_dir: PathBuf,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait PipelineExecutor: Send + Sync + 'static {
    async fn run(&self, job: &PipelineJob) -> Result<()>;
}

/// 以外部命令执行流水线
///
/// 命令行: `program args... <video_dir> <parameters-json>`，
/// 任务被中止时子进程随之被杀死。stdout 丢弃，stderr 只保留尾部。
pub struct CommandPipelineExecutor {
    commands: HashMap<PipelineKind, PipelineCommand>,
}

/// 错误信息中保留的 stderr 尾部长度（字符）
const STDERR_TAIL: usize = 2000;

/// 读取 stderr 时保留的最大字节数
const STDERR_BUFFER: usize = 4 * STDERR_TAIL;

impl CommandPipelineExecutor {
    pub fn new(commands: HashMap<PipelineKind, PipelineCommand>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl PipelineExecutor for CommandPipelineExecutor {
    async fn run(&self, job: &PipelineJob) -> Result<()> {
        let Some(command) = self.commands.get(&job.kind) else {
            bail!("流水线 {} 未配置执行命令", job.kind);
        };

        let parameters = serde_json::to_string(&job.parameters)?;
        debug!(
            "执行流水线命令: {} {:?} {:?}",
            command.program, command.args, job.video_dir
        );

        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .arg(&job.video_dir)
            .arg(&parameters)
            .env("VIDEO_ID", &job.video_id)
            .env("PIPELINE_KIND", job.kind.as_str())
            .env("PROCESSING_JOB_ID", &job.job_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("启动流水线命令失败: {}", command.program))?;

        let mut stderr_tail = Vec::new();
        if let Some(mut stderr) = child.stderr.take() {
            let mut buf = [0u8; 8192];
            loop {
                let n = stderr.read(&mut buf).await.context("读取流水线 stderr 失败")?;
                if n == 0 {
                    break;
                }
                stderr_tail.extend_from_slice(&buf[..n]);
                let excess = stderr_tail.len().saturating_sub(STDERR_BUFFER);
                stderr_tail.drain(..excess);
            }
        }
        let status = child.wait().await.context("等待流水线命令失败")?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_tail);
            let tail: String = {
                let chars: Vec<char> = stderr.trim_end().chars().collect();
                chars[chars.len().saturating_sub(STDERR_TAIL)..].iter().collect()
            };
            bail!("流水线命令退出码 {:?}: {}", status.code(), tail);
        }

        info!("流水线执行完成: job={} video={} kind={}", job.job_id, job.video_id, job.kind);
        Ok(())
    }
}
