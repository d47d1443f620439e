// 上传协调器
//
// 负责单个文件的完整上传流程：
// 1. 初始化分片上传，取得 uploadId
// 2. 使用 Semaphore 控制最大并发分片数，JoinSet 管理分片任务
// 3. 分片结果通过 JoinSet 回到控制循环，只有控制循环修改会话状态
// 4. 全部完成后按序号提交完成请求并校验确认
// 5. 任一分片不可恢复地失败或用户取消时，停止调度并中止上传

use super::events::ProgressReporter;
use super::part::{PartResult, PartUploader, UploadSource};
use super::plan::UploadPlan;
use super::retry::{run_with_retry, RetryPolicy};
use super::state::{UploadSession, UploadStatus};
use crate::credentials::CredentialCache;
use crate::error::{Result, UploadError};
use crate::storage::{ObjectTarget, StorageBackend, StorageError, StorageErrorKind};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 传输的最终结果
#[derive(Debug)]
pub struct TransferOutcome {
    pub transfer_id: String,
    pub status: UploadStatus,
    /// 初始化失败时为 None
    pub upload_id: Option<String>,
    /// 合并后对象的 ETag
    pub etag: Option<String>,
    pub error: Option<UploadError>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.status == UploadStatus::Completed
    }
}

/// 上传协调器（每次传输一个实例）
pub(crate) struct UploadCoordinator {
    transfer_id: String,
    backend: Arc<dyn StorageBackend>,
    credentials: Arc<CredentialCache>,
    source: Arc<UploadSource>,
    target: ObjectTarget,
    plan: Arc<UploadPlan>,
    max_concurrent_parts: usize,
    policy: RetryPolicy,
    verify_after_complete: bool,
    cancel: CancellationToken,
    reporter: ProgressReporter,
}

/// 协调器参数
pub(crate) struct CoordinatorParams {
    pub transfer_id: String,
    pub backend: Arc<dyn StorageBackend>,
    pub credentials: Arc<CredentialCache>,
    pub source: Arc<UploadSource>,
    pub target: ObjectTarget,
    pub plan: Arc<UploadPlan>,
    pub max_concurrent_parts: usize,
    pub policy: RetryPolicy,
    pub verify_after_complete: bool,
    pub cancel: CancellationToken,
}

impl UploadCoordinator {
    pub fn new(params: CoordinatorParams, reporter: ProgressReporter) -> Self {
        Self {
            transfer_id: params.transfer_id,
            backend: params.backend,
            credentials: params.credentials,
            source: params.source,
            target: params.target,
            plan: params.plan,
            max_concurrent_parts: params.max_concurrent_parts.max(1),
            policy: params.policy,
            verify_after_complete: params.verify_after_complete,
            cancel: params.cancel,
            reporter,
        }
    }

    /// 执行上传直到终态
    pub async fn run(mut self) -> TransferOutcome {
        info!(
            "[{}] 开始上传: target={}, 大小={} bytes, 分片数={}, 分片大小={}, 并发数={}",
            self.transfer_id,
            self.target,
            self.plan.total_size,
            self.plan.part_count(),
            self.plan.part_size,
            self.max_concurrent_parts
        );

        // 初始化期间的取消在初始化返回后处理
        let upload_id = match self.initiate().await {
            Ok(upload_id) => upload_id,
            Err(e) => {
                error!("[{}] 初始化分片上传失败: {}", self.transfer_id, e);
                return self.finish(UploadStatus::Failed, None, None, Some(e));
            }
        };

        let mut session = UploadSession::new(upload_id, &self.plan);
        self.reporter.initiated(&session);
        if let Err(e) = session.transition(UploadStatus::InProgress) {
            return self.abort(session, e).await;
        }
        self.reporter.status_changed(&session);

        if let Some(reason) = self.upload_parts(&mut session).await {
            return self.abort(session, reason).await;
        }

        self.finalize(session).await
    }

    async fn initiate(&self) -> Result<String> {
        let backend = self.backend.clone();
        let target = &self.target;
        let label = format!("[{}] 初始化", self.transfer_id);

        let upload_id = run_with_retry(&label, &self.policy, &self.credentials, None, |credentials| {
            let backend = backend.clone();
            async move { backend.initiate_upload(target, &credentials).await }
        })
        .await?;

        info!("[{}] 初始化成功: uploadId={}", self.transfer_id, upload_id);
        Ok(upload_id)
    }

    /// 调度并等待所有分片
    ///
    /// 返回 None 表示全部完成；返回错误时已停止调度并丢弃剩余分片结果。
    async fn upload_parts(&self, session: &mut UploadSession) -> Option<UploadError> {
        let uploader = PartUploader::new(
            self.backend.clone(),
            self.credentials.clone(),
            self.source.clone(),
            self.target.clone(),
            self.policy.clone(),
        );

        // 信号量控制并发数
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_parts));
        // 分片任务使用子令牌：失败时只取消分片，不影响会话令牌
        let part_cancel = self.cancel.child_token();
        let mut join_set: JoinSet<(u32, Result<PartResult>)> = JoinSet::new();
        let mut failure: Option<UploadError> = None;

        loop {
            if self.cancel.is_cancelled() {
                info!("[{}] 收到取消请求，停止调度新分片", self.transfer_id);
                failure = Some(UploadError::Cancelled);
                break;
            }

            // 在许可范围内尽量调度
            while let Some(index) = session.next_dispatchable() {
                let Some(part) = self.plan.part(index).copied() else {
                    failure = Some(UploadError::Internal(format!("分片计划中不存在分片 #{}", index)));
                    break;
                };
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                session.mark_dispatched(index);
                let uploader = uploader.clone();
                let upload_id = session.upload_id().to_string();
                let token = part_cancel.clone();

                join_set.spawn(async move {
                    let result = uploader.upload_part(&upload_id, &part, &token).await;
                    drop(permit);
                    (index, result)
                });
            }
            if failure.is_some() {
                break;
            }

            if join_set.is_empty() {
                if session.all_parts_completed() {
                    break;
                }
                failure = Some(UploadError::Internal(
                    "存在未完成分片但没有可调度的任务".to_string(),
                ));
                break;
            }

            let joined = tokio::select! {
                _ = self.cancel.cancelled() => continue,
                joined = join_set.join_next() => joined,
            };

            match joined {
                Some(Ok((index, Ok(result)))) => {
                    if session.record_completion(result) {
                        self.reporter.part_completed(session);
                        info!(
                            "[{}] 分片#{} ✓ 完成 ({}/{}, {}/{} bytes)",
                            self.transfer_id,
                            index,
                            session.parts_completed(),
                            session.parts_total(),
                            session.bytes_completed(),
                            session.bytes_total()
                        );
                    }
                }
                Some(Ok((index, Err(e)))) => {
                    session.release(index);
                    if !e.is_cancelled() {
                        error!("[{}] 分片#{} 不可恢复地失败: {}", self.transfer_id, index, e);
                    }
                    failure = Some(e);
                    break;
                }
                Some(Err(join_error)) => {
                    failure = Some(UploadError::Internal(format!(
                        "分片任务异常退出: {}",
                        join_error
                    )));
                    break;
                }
                None => {}
            }
        }

        // 通知进行中的分片停止，丢弃其结果
        part_cancel.cancel();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((index, _)) = joined {
                session.release(index);
                debug!("[{}] 丢弃分片#{} 的结果", self.transfer_id, index);
            }
        }

        failure
    }

    /// 提交完成请求（只提交一次）
    async fn finalize(mut self, mut session: UploadSession) -> TransferOutcome {
        let upload_id = session.upload_id().to_string();
        if let Err(e) = session.transition(UploadStatus::Finalizing) {
            return self.fail(&mut session, e);
        }
        self.reporter.status_changed(&session);
        if !session.begin_finalize() {
            let e = UploadError::Internal("重复提交完成请求".to_string());
            return self.fail(&mut session, e);
        }

        let parts = session.completed_part_list();
        info!(
            "[{}] 所有分片已完成，提交完成请求: uploadId={}, 分片数={}",
            self.transfer_id,
            upload_id,
            parts.len()
        );

        // 不重试瞬时错误；凭证过期时服务端未处理请求，刷新后重发
        let policy = RetryPolicy {
            max_retries: 0,
            ..self.policy.clone()
        };
        let backend = self.backend.clone();
        let target = &self.target;
        let label = format!("[{}] 完成上传", self.transfer_id);
        let result = run_with_retry(&label, &policy, &self.credentials, None, |credentials| {
            let backend = backend.clone();
            let parts = &parts;
            let upload_id = upload_id.as_str();
            async move {
                backend
                    .complete_upload(target, upload_id, parts, &credentials)
                    .await
            }
        })
        .await;

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                error!("[{}] 完成请求失败: {}", self.transfer_id, e);
                return self.fail(&mut session, e);
            }
        };

        if let Err(e) = session.verify_ack(&ack) {
            error!("[{}] 完成确认校验失败: {}", self.transfer_id, e);
            return self.fail(&mut session, e);
        }

        if self.verify_after_complete {
            if let Err(e) = self.verify_object().await {
                error!("[{}] 对象校验失败: {}", self.transfer_id, e);
                return self.fail(&mut session, e);
            }
        }

        if let Err(e) = session.transition(UploadStatus::Completed) {
            return self.fail(&mut session, e);
        }
        info!(
            "[{}] ✓ 上传完成: target={}, etag={:?}",
            self.transfer_id, self.target, ack.etag
        );
        self.finish(UploadStatus::Completed, Some(upload_id), ack.etag, None)
    }

    /// 查询合并后的对象大小，与文件大小比对
    async fn verify_object(&self) -> Result<()> {
        let backend = self.backend.clone();
        let target = &self.target;
        let label = format!("[{}] 查询对象", self.transfer_id);

        let metadata = run_with_retry(&label, &self.policy, &self.credentials, None, |credentials| {
            let backend = backend.clone();
            async move { backend.head_object(target, &credentials).await }
        })
        .await;

        match metadata {
            Ok(Some(metadata)) if metadata.content_length != self.plan.total_size => {
                Err(UploadError::Consistency(format!(
                    "对象大小 {} 与文件大小 {} 不一致",
                    metadata.content_length, self.plan.total_size
                )))
            }
            Ok(_) => Ok(()),
            Err(UploadError::Storage(e)) if e.kind == StorageErrorKind::NotFound => Err(
                UploadError::Consistency(format!("完成后对象不存在: {}", e)),
            ),
            Err(e) => {
                warn!("[{}] 查询对象失败，跳过大小校验: {}", self.transfer_id, e);
                Ok(())
            }
        }
    }

    /// 中止上传
    async fn abort(mut self, mut session: UploadSession, reason: UploadError) -> TransferOutcome {
        let upload_id = session.upload_id().to_string();
        if !session.begin_abort() {
            warn!("[{}] 中止已在进行中: uploadId={}", self.transfer_id, upload_id);
        }

        warn!(
            "[{}] 中止上传: uploadId={}, 原因: {}",
            self.transfer_id, upload_id, reason
        );

        let backend = self.backend.clone();
        let target = &self.target;
        let label = format!("[{}] 中止上传", self.transfer_id);
        let result = run_with_retry(&label, &self.policy, &self.credentials, None, |credentials| {
            let backend = backend.clone();
            let upload_id = upload_id.as_str();
            async move { backend.abort_upload(target, upload_id, &credentials).await }
        })
        .await;

        match result {
            Ok(()) => {
                if let Err(e) = session.transition(UploadStatus::Aborted) {
                    return self.fail(&mut session, e);
                }
                info!("[{}] 已中止: uploadId={}", self.transfer_id, upload_id);
                self.finish(UploadStatus::Aborted, Some(upload_id), None, Some(reason))
            }
            Err(e) => {
                let cause = match e {
                    UploadError::Storage(cause) => cause,
                    other => StorageError::new(StorageErrorKind::Unknown, other.to_string()),
                };
                error!(
                    "[{}] 中止上传失败，远端可能残留分片: uploadId={}, 错误: {}",
                    self.transfer_id, upload_id, cause
                );
                let error = UploadError::AbortFailure {
                    upload_id: upload_id.clone(),
                    reason: reason.to_string(),
                    cause,
                };
                self.fail(&mut session, error)
            }
        }
    }

    fn fail(&mut self, session: &mut UploadSession, error: UploadError) -> TransferOutcome {
        if let Err(e) = session.transition(UploadStatus::Failed) {
            warn!("[{}] {}", self.transfer_id, e);
        }
        let upload_id = session.upload_id().to_string();
        self.finish(UploadStatus::Failed, Some(upload_id), None, Some(error))
    }

    fn finish(
        &mut self,
        status: UploadStatus,
        upload_id: Option<String>,
        etag: Option<String>,
        error: Option<UploadError>,
    ) -> TransferOutcome {
        self.reporter
            .terminal(status, upload_id.as_deref(), error.as_ref());

        TransferOutcome {
            transfer_id: self.transfer_id.clone(),
            status,
            upload_id,
            etag,
            error,
        }
    }
}
