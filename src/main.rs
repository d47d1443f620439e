use anyhow::Context;
use s3_direct_upload::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    credentials, logging, S3Client, TransferSession, UploadEvent, UploadOptions, UploadSource,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 配置文件路径，可通过环境变量 S3_UPLOAD_CONFIG 覆盖
fn config_path() -> String {
    std::env::var("S3_UPLOAD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

fn print_usage() {
    eprintln!("用法: s3-direct-upload <文件路径> [对象键]");
    eprintln!("配置文件: {}（可通过 S3_UPLOAD_CONFIG 指定）", DEFAULT_CONFIG_PATH);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(file) = args.first() else {
        print_usage();
        std::process::exit(2);
    };
    let key = args.get(1).cloned();

    let config = AppConfig::load_or_default(&config_path()).await;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("S3 Direct Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));
    config.validate().context("配置无效")?;

    let backend = Arc::new(S3Client::new(&config.storage)?);
    let credential_cache = Arc::new(credentials::cache_from_config(&config.credentials)?);
    let session = TransferSession::new(
        backend,
        credential_cache,
        config.upload.clone(),
        config.storage.clone(),
    );

    let source = UploadSource::from_path(file)
        .await
        .with_context(|| format!("无法读取上传文件: {}", file))?;
    let options = UploadOptions {
        key,
        ..Default::default()
    };

    let mut handle = session.start(source, options)?;
    info!("上传已开始: transfer_id={}, target={}", handle.transfer_id(), handle.target());

    // 进度事件写入日志
    if let Some(mut events) = handle.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    UploadEvent::Progress {
                        bytes_completed,
                        bytes_total,
                        parts_completed,
                        parts_total,
                        ..
                    } => info!(
                        "进度: {}/{} bytes, {}/{} 分片",
                        bytes_completed, bytes_total, parts_completed, parts_total
                    ),
                    UploadEvent::Initiated { upload_id, .. } => {
                        info!("服务端已创建上传: uploadId={}", upload_id)
                    }
                    UploadEvent::Terminal { status, error, .. } => {
                        info!("上传结束: status={}, error={:?}", status, error)
                    }
                }
            }
        });
    }

    // Ctrl+C 取消上传，等待中止完成后退出
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        wait_for_ctrl_c().await;
        info!("收到 Ctrl+C，正在取消上传...");
        cancel.cancel();
    });

    let outcome = handle.wait().await;

    match &outcome.error {
        None => {
            info!(
                "✓ 上传成功: uploadId={:?}, etag={:?}",
                outcome.upload_id, outcome.etag
            );
            Ok(())
        }
        Some(e) => {
            if e.requires_manual_cleanup() {
                warn!("远端可能残留未清理的分片，请手动中止 uploadId={:?}", outcome.upload_id);
            }
            error!("上传失败: status={}, 错误: {}", outcome.status, e);
            anyhow::bail!("上传失败: {}", e)
        }
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("监听 Ctrl+C 失败: {}", e);
        std::future::pending::<()>().await;
    }
}
