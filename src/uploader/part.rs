// 单个分片上传
//
// 读取分片字节范围 → 携带 uploadId 和分片序号发送 → 返回服务端指纹

use super::plan::PartSpec;
use super::retry::{run_with_retry, RetryPolicy};
use crate::credentials::CredentialCache;
use crate::error::{Result, UploadError};
use crate::storage::{ObjectTarget, StorageBackend, StorageError, StorageErrorKind};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// 上传源
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 本地文件
    File { path: PathBuf, size: u64 },
    /// 内存数据
    Memory { name: String, data: Bytes },
}

impl UploadSource {
    /// 从本地文件创建（读取文件大小）
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Configuration(format!(
                "上传源不是普通文件: {:?}",
                path
            )));
        }
        Ok(Self::File {
            path,
            size: metadata.len(),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Memory {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::File { size, .. } => *size,
            Self::Memory { data, .. } => data.len() as u64,
        }
    }

    /// 文件名（用于生成对象键）
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::File { path, .. } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            Self::Memory { name, .. } => Some(name.clone()).filter(|n| !n.is_empty()),
        }
    }

    /// 读取分片数据
    pub async fn read_part(&self, part: &PartSpec) -> Result<Bytes> {
        if part.length == 0 {
            return Ok(Bytes::new());
        }

        match self {
            Self::File { path, .. } => {
                let mut file = File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(part.offset)).await?;

                let mut buffer = vec![0u8; part.length as usize];
                file.read_exact(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
            Self::Memory { data, .. } => {
                let range = part.range();
                if range.end > data.len() as u64 {
                    return Err(UploadError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("分片范围 {:?} 超出数据长度 {}", range, data.len()),
                    )));
                }
                Ok(data.slice(range.start as usize..range.end as usize))
            }
        }
    }
}

/// 分片上传结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartResult {
    pub index: u32,
    /// 服务端返回的分片指纹
    pub fingerprint: String,
    pub size_bytes: u64,
}

/// 分片上传器
///
/// 同一次上传的所有分片共享一个实例（克隆开销很小）。
#[derive(Clone)]
pub struct PartUploader {
    backend: Arc<dyn StorageBackend>,
    credentials: Arc<CredentialCache>,
    source: Arc<UploadSource>,
    target: ObjectTarget,
    policy: RetryPolicy,
}

impl PartUploader {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        credentials: Arc<CredentialCache>,
        source: Arc<UploadSource>,
        target: ObjectTarget,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            credentials,
            source,
            target,
            policy,
        }
    }

    /// 上传一个分片
    ///
    /// 瞬时错误按重试策略重试，耗尽后返回 `PartUpload`；
    /// 取消时返回 `Cancelled`，进行中的请求结果被丢弃。
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part: &PartSpec,
        cancel: &CancellationToken,
    ) -> Result<PartResult> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        debug!(
            "[分片#{}] 开始上传 (偏移: {}, 大小: {} bytes)",
            part.index, part.offset, part.length
        );

        // 读取失败（例如文件在上传期间被截断）同样归为该分片的失败
        let body = match self.source.read_part(part).await {
            Ok(body) => body,
            Err(e) => {
                error!("[分片#{}] 读取分片数据失败: {}", part.index, e);
                return Err(UploadError::PartUpload {
                    index: part.index,
                    cause: StorageError::new(
                        StorageErrorKind::Unknown,
                        format!("读取分片数据失败: {}", e),
                    ),
                });
            }
        };
        let backend = self.backend.clone();
        let target = &self.target;
        let index = part.index;
        let label = format!("[分片#{}]", index);

        let result = run_with_retry(
            &label,
            &self.policy,
            &self.credentials,
            Some(cancel),
            |credentials| {
                let backend = backend.clone();
                let body = body.clone();
                async move {
                    backend
                        .upload_part(target, upload_id, index, body, &credentials)
                        .await
                }
            },
        )
        .await;

        match result {
            Ok(fingerprint) => {
                debug!("[分片#{}] ✓ 上传成功, etag={}", index, fingerprint);
                Ok(PartResult {
                    index,
                    fingerprint,
                    size_bytes: part.length,
                })
            }
            Err(UploadError::Storage(cause)) => {
                error!("[分片#{}] 上传失败: {}", index, cause);
                Err(UploadError::PartUpload { index, cause })
            }
            Err(e) => Err(e),
        }
    }
}
