//! 上传错误类型
//!
//! 区分五类错误：配置错误、凭证错误、分片上传错误、一致性错误、清理失败。
//! 分片级的瞬时错误由 PartUploader 的重试循环吸收，不会到达调用方。

use crate::storage::StorageError;
use thiserror::Error;

/// 上传引擎错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 分片计划或参数非法（在任何网络调用之前返回）
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 凭证获取或刷新失败
    #[error("凭证错误: {0}")]
    Auth(String),

    /// 分片重试耗尽或遇到不可重试错误
    #[error("分片 #{index} 上传失败: {cause}")]
    PartUpload {
        index: u32,
        #[source]
        cause: StorageError,
    },

    /// 完成响应与本地已完成分片记录不一致
    #[error("一致性校验失败: {0}")]
    Consistency(String),

    /// 中止请求本身失败，远端可能残留未清理的分片
    #[error("中止上传失败 (uploadId={upload_id}, 原因: {reason}): {cause}")]
    AbortFailure {
        upload_id: String,
        reason: String,
        #[source]
        cause: StorageError,
    },

    /// 初始化或完成请求失败
    #[error("存储服务请求失败: {0}")]
    Storage(#[from] StorageError),

    /// 用户取消
    #[error("上传已取消")]
    Cancelled,

    /// 读取源文件失败
    #[error("读取源文件失败: {0}")]
    Io(#[from] std::io::Error),

    /// 分片任务异常退出
    #[error("内部错误: {0}")]
    Internal(String),
}

impl UploadError {
    /// 是否由用户取消引起
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// 是否意味着远端可能需要人工清理
    pub fn requires_manual_cleanup(&self) -> bool {
        matches!(self, UploadError::AbortFailure { .. })
    }
}

/// 上传引擎结果类型
pub type Result<T> = std::result::Result<T, UploadError>;
