//! 对象存储访问层
//!
//! - `types.rs`: 错误分类与请求/响应类型
//! - `s3.rs`: 基于 reqwest 的 S3 兼容客户端
//! - `sigv4.rs`: AWS SigV4 请求签名
//! - `memory.rs`: 进程内存储（带故障注入），用于测试和本地联调

pub mod memory;
pub mod s3;
pub mod sigv4;
mod types;

pub use memory::MemoryStorage;
pub use s3::S3Client;
pub use types::*;

use crate::credentials::Credentials;
use async_trait::async_trait;
use bytes::Bytes;

/// 分片上传协议
///
/// 每次调用都携带调用时的凭证，凭证刷新由上层负责。
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// 初始化分片上传，返回 uploadId
    async fn initiate_upload(
        &self,
        target: &ObjectTarget,
        credentials: &Credentials,
    ) -> Result<String, StorageError>;

    /// 上传单个分片，返回分片指纹（ETag）
    async fn upload_part(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
        credentials: &Credentials,
    ) -> Result<String, StorageError>;

    /// 提交有序分片列表，合并为最终对象
    async fn complete_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        parts: &[CompletedPart],
        credentials: &Credentials,
    ) -> Result<CompleteAck, StorageError>;

    /// 中止上传，释放服务端已上传的分片
    async fn abort_upload(
        &self,
        target: &ObjectTarget,
        upload_id: &str,
        credentials: &Credentials,
    ) -> Result<(), StorageError>;

    /// 查询对象元数据（用于完成后校验）
    ///
    /// 后端不支持查询时返回 `Ok(None)`；对象不存在时返回 `NotFound` 错误。
    async fn head_object(
        &self,
        _target: &ObjectTarget,
        _credentials: &Credentials,
    ) -> Result<Option<ObjectMetadata>, StorageError> {
        Ok(None)
    }
}
