// 上传代理：收集本地视频，按调度器规则上传到入库服务

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use video_ingest_rust::{
    config::{LogConfig, DEFAULT_CONFIG_PATH},
    events::UploadEvent,
    logging,
    persistence::{scan_recoverable_uploads, PersistentUploadStore},
    protocol::DuplicateDecision,
    uploader::{
        CollectedFile, DirectoryCollector, HttpResumableTransport, ResumableTransport,
        SchedulerConfig, UploadScheduler, UploadStatus, VideoFilePreview,
    },
    AppConfig,
};

/// Ctrl+C 后等待服务端会话终止的上限
const TERMINATE_WAIT: Duration = Duration::from_secs(10);

/// 视频上传代理
#[derive(Debug, Parser)]
#[command(name = "video-ingest-upload", version)]
struct Cli {
    /// 要上传的文件或目录
    paths: Vec<PathBuf>,

    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 上传服务地址，覆盖配置文件
    #[arg(long)]
    endpoint: Option<String>,

    /// 内容重复时的默认决定: keep_both / replace_existing / cancel_upload
    #[arg(long, value_parser = parse_decision)]
    on_duplicate: Option<DuplicateDecision>,

    /// 自动恢复上次未完成的上传
    #[arg(long)]
    resume: bool,

    /// 服务端已存在同路径视频时也上传
    #[arg(long)]
    all: bool,

    /// 只列出将要上传的文件
    #[arg(long)]
    dry_run: bool,
}

fn parse_decision(s: &str) -> Result<DuplicateDecision, String> {
    DuplicateDecision::parse(s)
        .ok_or_else(|| format!("无效的决定 {}，可选 keep_both / replace_existing / cancel_upload", s))
}

async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

/// 收集文件并查询服务端是否已有同路径视频
async fn preview_files(
    transport: &dyn ResumableTransport,
    paths: &[PathBuf],
    include_existing: bool,
) -> Vec<VideoFilePreview> {
    let report = DirectoryCollector::videos_only().snapshot(paths).collect().await;
    for failure in &report.failures {
        warn!("跳过 {}: {}", failure.relative_path, failure.error);
    }

    let mut previews = Vec::with_capacity(report.files.len());
    for file in report.files {
        let exists = match transport.exists_by_path(&file.relative_path).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("查询 {} 是否已存在失败: {}", file.relative_path, e);
                false
            }
        };
        let mut preview = VideoFilePreview::new(file.local_path, file.relative_path, file.size, exists);
        if include_existing {
            preview.selected = true;
        }
        previews.push(preview);
    }
    previews
}

fn spawn_decision(
    tasks: &mut JoinSet<()>,
    scheduler: &UploadScheduler,
    upload_id: String,
    decision: DuplicateDecision,
) {
    let scheduler = scheduler.clone();
    tasks.spawn(async move {
        match scheduler.resolve_duplicate(&upload_id, decision).await {
            Ok(outcome) => info!(
                "重复内容已处理: upload={} decision={} video={:?}",
                upload_id,
                decision.as_str(),
                outcome.video_id
            ),
            Err(e) => error!("重复内容处理失败: upload={} 错误: {}", upload_id, e),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    let mut config = AppConfig::load_or_default(&cli.config).await;
    if let Some(endpoint) = &cli.endpoint {
        config.upload.endpoint = endpoint.clone();
    }
    config.validate()?;

    let transport = Arc::new(HttpResumableTransport::new(
        &config.upload.endpoint,
        Duration::from_secs(config.upload.request_timeout_secs),
    )?);
    let store = if config.persistence.enabled {
        PersistentUploadStore::new(config.persistence.state_dir.clone())
    } else {
        PersistentUploadStore::disabled()
    };

    let (scheduler, mut events) = UploadScheduler::new(
        SchedulerConfig::from(&config.upload),
        transport.clone(),
        store.clone(),
    );
    let mut decisions = JoinSet::new();

    // 恢复上次未完成的上传
    let auto_resume = cli.resume || config.upload.auto_resume;
    let recovered = scan_recoverable_uploads(&store, auto_resume)?;
    for meta in recovered.recoverable {
        let id = meta.id.clone();
        let pending_duplicate = meta.status == UploadStatus::DuplicatePending;
        info!("恢复上传: {} ({:?})", meta.relative_path, meta.status);
        scheduler.restore(meta);
        if let (true, Some(decision)) = (pending_duplicate, cli.on_duplicate) {
            spawn_decision(&mut decisions, &scheduler, id, decision);
        }
    }

    let previews = preview_files(transport.as_ref(), &cli.paths, cli.all).await;
    for p in &previews {
        info!(
            "{} {} ({} bytes){}",
            if p.selected { "[上传]" } else { "[跳过]" },
            p.relative_path,
            p.file_size,
            if p.exists_on_server { " 服务端已存在同路径视频" } else { "" }
        );
    }
    if cli.dry_run {
        return Ok(());
    }

    let files: Vec<CollectedFile> = previews
        .into_iter()
        .filter(|p| p.selected)
        .map(|p| CollectedFile {
            local_path: p.local_path,
            relative_path: p.relative_path,
            size: p.file_size,
        })
        .collect();
    let ids = scheduler.enqueue_files(files);
    info!("已加入 {} 个上传", ids.len());

    let mut idle_check = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                UploadEvent::Progress { upload_id, progress, .. } => {
                    info!("上传进度: {} {:.1}%", upload_id, progress);
                }
                UploadEvent::Retrying { upload_id, attempt, delay_ms } => {
                    warn!("上传重试: {} 第 {} 次, {}ms 后开始", upload_id, attempt, delay_ms);
                }
                UploadEvent::Completed { upload_id, video_id } => {
                    info!("上传完成: {} -> video {}", upload_id, video_id);
                }
                UploadEvent::Failed { upload_id, error } => {
                    error!("上传失败: {} {}", upload_id, error);
                }
                UploadEvent::DuplicatePending { upload_id, duplicate_of_display_path, .. } => {
                    match cli.on_duplicate {
                        Some(decision) => spawn_decision(&mut decisions, &scheduler, upload_id, decision),
                        None => warn!(
                            "上传 {} 与 {} 内容相同，使用 --on-duplicate 做出决定",
                            upload_id, duplicate_of_display_path
                        ),
                    }
                }
                _ => {}
            },
            Some(_) = decisions.join_next(), if !decisions.is_empty() => {}
            _ = idle_check.tick() => {
                if decisions.is_empty() && scheduler.is_idle() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("收到 Ctrl+C，中止所有上传...");
                // 退出前等待服务端会话终止
                let aborted = scheduler.abort_all_and_wait(TERMINATE_WAIT).await;
                info!("已中止 {} 个上传", aborted);
                break;
            }
        }
    }

    let agg = scheduler.aggregate();
    info!(
        "上传结束: 共 {} 个, {}/{} bytes, 存在失败: {}",
        agg.total, agg.bytes_uploaded, agg.bytes_total, agg.any_error
    );
    scheduler.shutdown();
    if agg.any_error {
        anyhow::bail!("部分上传失败");
    }
    Ok(())
}
