use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

use recycler_core::{init_logging, LogFormat, RecyclerConfig};

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("recycler")
        .version("1.0.0")
        .about("资源回收编排系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时依次尝试默认路径"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = RecyclerConfig::load(config_path).context("加载配置失败")?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.log.format = format.parse::<LogFormat>()?;
    }
    init_logging(&config.log)?;

    info!("启动资源回收编排系统");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await?;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("资源回收编排系统已退出");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("安装SIGTERM信号处理器失败")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("安装Ctrl+C信号处理器失败")?;
                info!("收到Ctrl+C信号");
            }
            _ = terminate.recv() => {
                info!("收到SIGTERM信号");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("安装Ctrl+C信号处理器失败")?;
        info!("收到Ctrl+C信号");
    }

    Ok(())
}
