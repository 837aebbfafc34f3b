//! XJP Provision Agent - 云资源编排代理
//!
//! 驱动声明式 provisioning 工具管理云主机生命周期，并实时推送部署日志

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::env::constants::VERSION;
use crate::config::EnvConfig;
use crate::state::AppState;

/// 命令行覆盖的运行参数
#[derive(Debug, Default, Clone)]
pub struct RuntimeConfig {
    /// 覆盖监听端口
    pub port_override: Option<u16>,
    /// 覆盖数据目录
    pub data_dir: Option<PathBuf>,
}

/// 初始化日志、加载配置并运行代理，直到收到关闭信号
pub async fn init_and_run_agent_with_config(runtime: RuntimeConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = VERSION, "XJP provision agent starting");

    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }
    if let Some(data_dir) = runtime.data_dir {
        config.data_dir = data_dir;
    }
    if config.api_key == "change-me-in-production" {
        warn!("Using default API key, set PROVISION_AGENT_API_KEY before exposing the agent");
    }

    let port = config.port;
    let state = Arc::new(AppState::open(config).await?);

    match state.orchestrator.reconcile().await {
        Ok(0) => {}
        Ok(count) => warn!(count, "Marked interrupted deployments as failed"),
        Err(e) => error!(error = %e, "Failed to reconcile deployments"),
    }
    let cleanup = state.spawn_log_cleanup();

    let app = api::router(Arc::clone(&state));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await
        .context("server error")?;

    state.trigger_shutdown();
    let _ = cleanup.await;
    info!("XJP provision agent stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
        () = cancel.cancelled() => info!("Shutdown requested"),
    }
    cancel.cancel();
}
