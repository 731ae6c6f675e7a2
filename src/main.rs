use clap::Parser;
use tracing::info;
use video_ingest_rust::{
    config::{LogConfig, DEFAULT_CONFIG_PATH},
    logging, server, AppConfig, AppState,
};

/// 视频上传入库服务
#[derive(Debug, Parser)]
#[command(name = "video-ingest-server", version)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

/// 加载日志配置
///
/// 尝试从配置文件加载，失败时返回默认配置
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 先加载日志配置，_log_guard 必须存活到进程结束
    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Video Ingest Rust v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&cli.config).await;
    config.validate()?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(
        "处理并发上限: {}, 计数器: {:?}",
        config.processing.max_total_concurrent_processing, config.processing.counter
    );

    let app_state = AppState::new(config).await?;
    info!("应用状态初始化完成");

    let app = server::build_router(app_state.clone());

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    app_state.shutdown();
    info!("应用已安全退出");

    Ok(())
}
