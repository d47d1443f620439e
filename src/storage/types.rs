// 存储层类型定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 存储请求错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误 5xx（可重试）
    ServerError,
    /// 限流（可重试）
    Throttled,
    /// 临时凭证过期（刷新凭证后重试，不消耗重试次数）
    CredentialsExpired,
    /// 权限不足（不可重试）
    Forbidden,
    /// 上传或对象不存在（不可重试）
    NotFound,
    /// 参数错误（不可重试）
    BadRequest,
    /// 未知错误
    Unknown,
}

impl StorageErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::Network
                | StorageErrorKind::Timeout
                | StorageErrorKind::ServerError
                | StorageErrorKind::Throttled
        )
    }

    /// 根据 HTTP 状态码和 S3 错误码分类
    pub fn classify(status: u16, code: Option<&str>) -> Self {
        match code {
            Some("ExpiredToken") | Some("TokenRefreshRequired") => {
                return StorageErrorKind::CredentialsExpired
            }
            Some("SlowDown") => return StorageErrorKind::Throttled,
            Some("RequestTimeout") => return StorageErrorKind::Timeout,
            Some("NoSuchUpload") | Some("NoSuchKey") | Some("NoSuchBucket") => {
                return StorageErrorKind::NotFound
            }
            _ => {}
        }

        match status {
            429 | 503 => StorageErrorKind::Throttled,
            500..=599 => StorageErrorKind::ServerError,
            408 => StorageErrorKind::Timeout,
            401 | 403 => StorageErrorKind::Forbidden,
            404 => StorageErrorKind::NotFound,
            400..=499 => StorageErrorKind::BadRequest,
            _ => StorageErrorKind::Unknown,
        }
    }
}

/// 存储请求错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    pub fn is_credentials_expired(&self) -> bool {
        self.kind == StorageErrorKind::CredentialsExpired
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for StorageError {}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            StorageErrorKind::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            StorageErrorKind::Network
        } else if let Some(status) = e.status() {
            StorageErrorKind::classify(status.as_u16(), None)
        } else {
            StorageErrorKind::Unknown
        };
        StorageError::new(kind, e.to_string())
    }
}

/// 上传目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectTarget {
    pub bucket: String,
    pub key: String,
}

impl ObjectTarget {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// 完成请求中的分片条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 分片序号（从 1 开始）
    pub index: u32,
    /// 服务端返回的分片指纹（ETag）
    pub fingerprint: String,
}

/// 完成请求的确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteAck {
    /// 服务端记录的分片列表（按序号升序）
    pub parts: Vec<CompletedPart>,
    /// 合并后对象的 ETag
    pub etag: Option<String>,
}

/// 对象元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub etag: Option<String>,
    pub content_length: u64,
}
