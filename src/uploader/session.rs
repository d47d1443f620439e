// 传输会话
//
// 对外入口：start(file, options) → TransferHandle，cancel(handle)，progress(handle)。
// 每次 start 创建独立的协调器和会话状态，多个文件并发上传互不干扰。

use super::coordinator::{CoordinatorParams, TransferOutcome, UploadCoordinator};
use super::events::{ProgressReporter, TransferProgress, UploadEvent};
use super::part::UploadSource;
use super::plan::plan_for;
use super::retry::RetryPolicy;
use super::state::UploadStatus;
use crate::config::{StorageConfig, UploadConfig};
use crate::credentials::CredentialCache;
use crate::error::{Result, UploadError};
use crate::storage::{ObjectTarget, StorageBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 单次上传的选项，未设置的字段使用配置中的默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadOptions {
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub max_concurrent_parts: Option<usize>,
    pub max_retries: Option<u32>,
}

impl UploadOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }
}

/// 传输句柄
pub struct TransferHandle {
    transfer_id: String,
    target: ObjectTarget,
    cancel: CancellationToken,
    progress: watch::Receiver<TransferProgress>,
    events: Option<mpsc::UnboundedReceiver<UploadEvent>>,
    join: JoinHandle<TransferOutcome>,
}

impl TransferHandle {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn target(&self) -> &ObjectTarget {
        &self.target
    }

    /// 取消上传
    ///
    /// 可在任意阶段调用，可重复调用；已进入终态时不做任何事。
    /// 提交完成请求期间的取消不会打断该请求。
    pub fn cancel(&self) {
        if self.progress().status.is_terminal() || self.cancel.is_cancelled() {
            return;
        }
        info!("[{}] 请求取消上传", self.transfer_id);
        self.cancel.cancel();
    }

    /// 取消令牌，用于在其他任务中取消（例如信号处理）
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 最新进度快照
    pub fn progress(&self) -> TransferProgress {
        *self.progress.borrow()
    }

    /// 订阅进度变化
    pub fn subscribe_progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.clone()
    }

    /// 取走事件接收端（只能取一次）
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.events.take()
    }

    /// 等待传输结束
    pub async fn wait(self) -> TransferOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => TransferOutcome {
                transfer_id: self.transfer_id,
                status: UploadStatus::Failed,
                upload_id: None,
                etag: None,
                error: Some(UploadError::Internal(format!("上传任务异常退出: {}", e))),
            },
        }
    }
}

/// 传输会话工厂
pub struct TransferSession {
    backend: Arc<dyn StorageBackend>,
    credentials: Arc<CredentialCache>,
    upload_config: UploadConfig,
    storage_config: StorageConfig,
}

impl TransferSession {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        credentials: Arc<CredentialCache>,
        upload_config: UploadConfig,
        storage_config: StorageConfig,
    ) -> Self {
        Self {
            backend,
            credentials,
            upload_config,
            storage_config,
        }
    }

    /// 确定上传目标
    ///
    /// 对象键优先取 `options.key`，否则为 `base_key/文件名`（`base_key` 为 "/" 时即桶根目录）；
    /// 存储桶优先取 `options.bucket`，否则取配置。
    /// 含 "." 或 ".." 路径段的键会被 URL 规范化改写，不支持。
    pub fn resolve_target(
        &self,
        source: &UploadSource,
        options: &UploadOptions,
    ) -> Result<ObjectTarget> {
        let bucket = options
            .bucket
            .clone()
            .or_else(|| self.storage_config.bucket.clone())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| UploadError::Configuration("未指定存储桶".to_string()))?;

        let key = match options.key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => key.to_string(),
            None => {
                let base = self
                    .storage_config
                    .base_key
                    .as_deref()
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| {
                        UploadError::Configuration("未指定对象键，且未配置 base_key".to_string())
                    })?;
                let name = source.file_name().ok_or_else(|| {
                    UploadError::Configuration("无法从上传源获取文件名".to_string())
                })?;
                match base.trim_matches('/') {
                    "" => name.to_string(),
                    base => format!("{}/{}", base, name),
                }
            }
        };

        if key.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(UploadError::Configuration(format!(
                "对象键不能包含 \".\" 或 \"..\" 路径段: {}",
                key
            )));
        }

        Ok(ObjectTarget::new(bucket, key))
    }

    /// 开始上传
    ///
    /// 分片计划和参数在任何网络请求之前校验，非法时直接返回配置错误。
    /// 需要在 tokio 运行时中调用。
    pub fn start(&self, source: UploadSource, options: UploadOptions) -> Result<TransferHandle> {
        let mut config = self.upload_config.clone();
        if let Some(max_concurrent_parts) = options.max_concurrent_parts {
            config.max_concurrent_parts = max_concurrent_parts;
        }
        if let Some(max_retries) = options.max_retries {
            config.max_retries = max_retries;
        }
        config.validate().map_err(UploadError::Configuration)?;

        let target = self.resolve_target(&source, &options)?;
        let plan = Arc::new(plan_for(source.size(), &config)?);

        let transfer_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (reporter, progress, events) =
            ProgressReporter::new(transfer_id.clone(), TransferProgress::initial(&plan));

        info!(
            "[{}] 创建传输: target={}, 大小={} bytes, 分片数={}",
            transfer_id,
            target,
            plan.total_size,
            plan.part_count()
        );

        let coordinator = UploadCoordinator::new(
            CoordinatorParams {
                transfer_id: transfer_id.clone(),
                backend: self.backend.clone(),
                credentials: self.credentials.clone(),
                source: Arc::new(source),
                target: target.clone(),
                plan,
                max_concurrent_parts: config.max_concurrent_parts,
                policy: RetryPolicy::from(&config),
                verify_after_complete: config.verify_after_complete,
                cancel: cancel.clone(),
            },
            reporter,
        );
        let join = tokio::spawn(coordinator.run());

        Ok(TransferHandle {
            transfer_id,
            target,
            cancel,
            progress,
            events: Some(events),
            join,
        })
    }

    pub fn cancel(&self, handle: &TransferHandle) {
        handle.cancel();
    }

    pub fn progress(&self, handle: &TransferHandle) -> TransferProgress {
        handle.progress()
    }
}
