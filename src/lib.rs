// S3 Direct Upload Library
// 分片直传对象存储的上传引擎

// 配置管理模块
pub mod config;

// 临时凭证模块
pub mod credentials;

// 错误类型
pub mod error;

// 日志模块
pub mod logging;

// 对象存储访问模块
pub mod storage;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use credentials::{CredentialCache, CredentialProvider, Credentials};
pub use error::UploadError;
pub use storage::{MemoryStorage, ObjectTarget, S3Client, StorageBackend};
pub use uploader::{
    TransferHandle, TransferOutcome, TransferProgress, TransferSession, UploadEvent,
    UploadOptions, UploadSource, UploadStatus,
};
