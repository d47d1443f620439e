// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 存储服务配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 凭证配置
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 存储服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 区域
    #[serde(default = "default_region")]
    pub region: String,
    /// 默认存储桶
    #[serde(default)]
    pub bucket: Option<String>,
    /// 对象键前缀，未指定键时与文件名拼接
    #[serde(default)]
    pub base_key: Option<String>,
    /// 自定义端点（MinIO 等兼容服务），设置后使用路径风格地址
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 是否使用传输加速端点
    #[serde(default)]
    pub use_accelerate: bool,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            bucket: None,
            base_key: None,
            endpoint: None,
            use_accelerate: false,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最小分片大小（字节，默认 5MB）
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
    /// 最大分片大小（字节，默认 5GB）
    #[serde(default = "default_max_part_size")]
    pub max_part_size: u64,
    /// 最大分片数量（默认 10000）
    #[serde(default = "default_max_part_count")]
    pub max_part_count: u32,
    /// 同时上传的分片数（默认 4）
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
    /// 分片最大重试次数（首次尝试之外）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 退避基础时间（毫秒）
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 退避上限（毫秒）
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 退避抖动比例（0.2 表示 ±20%）
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// 单个分片因凭证过期而刷新的最大次数
    #[serde(default = "default_max_credential_refreshes")]
    pub max_credential_refreshes: u32,
    /// 完成后是否查询对象大小进行校验
    #[serde(default = "default_verify_after_complete")]
    pub verify_after_complete: bool,
}

fn default_min_part_size() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_max_part_size() -> u64 {
    5 * 1024 * 1024 * 1024 // 5GB
}

fn default_max_part_count() -> u32 {
    10_000
}

fn default_max_concurrent_parts() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_max_credential_refreshes() -> u32 {
    3
}

fn default_verify_after_complete() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_part_size: default_min_part_size(),
            max_part_size: default_max_part_size(),
            max_part_count: default_max_part_count(),
            max_concurrent_parts: default_max_concurrent_parts(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_credential_refreshes: default_max_credential_refreshes(),
            verify_after_complete: default_verify_after_complete(),
        }
    }
}

/// 凭证来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialsMode {
    /// 配置文件中的固定凭证
    Static,
    /// 环境变量
    #[default]
    Environment,
    /// HTTP 凭证接口
    Endpoint,
}

/// 凭证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// 凭证来源
    #[serde(default)]
    pub mode: CredentialsMode,
    /// static 模式的 AccessKeyId
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// static 模式的 SecretAccessKey
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// static 模式的会话令牌
    #[serde(default)]
    pub session_token: Option<String>,
    /// endpoint 模式的凭证接口地址
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// endpoint 模式的 Bearer Token
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// 获取凭证的最大尝试次数
    #[serde(default = "default_auth_retries")]
    pub auth_retries: u32,
    /// 过期前提前刷新的时间（秒）
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: i64,
}

fn default_auth_retries() -> u32 {
    3
}

fn default_refresh_window_secs() -> i64 {
    60
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            mode: CredentialsMode::default(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint_url: None,
            bearer_token: None,
            auth_retries: default_auth_retries(),
            refresh_window_secs: default_refresh_window_secs(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl UploadConfig {
    /// 校验上传参数
    pub fn validate(&self) -> Result<(), String> {
        if self.min_part_size == 0 {
            return Err("最小分片大小不能为 0".to_string());
        }
        if self.min_part_size > self.max_part_size {
            return Err(format!(
                "最小分片大小 {} 大于最大分片大小 {}",
                self.min_part_size, self.max_part_size
            ));
        }
        if self.max_part_count == 0 {
            return Err("最大分片数量不能为 0".to_string());
        }
        if self.max_concurrent_parts == 0 {
            return Err("并发分片数不能为 0".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(format!("抖动比例必须在 [0, 1) 之间: {}", self.jitter_ratio));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(format!(
                "退避基础时间 {}ms 大于上限 {}ms",
                self.backoff_base_ms, self.backoff_max_ms
            ));
        }
        Ok(())
    }
}

impl CredentialsConfig {
    /// 校验凭证来源所需字段
    pub fn validate(&self) -> Result<(), String> {
        match self.mode {
            CredentialsMode::Static => {
                if self.access_key_id.as_deref().unwrap_or("").is_empty()
                    || self.secret_access_key.as_deref().unwrap_or("").is_empty()
                {
                    return Err("static 模式需要 access_key_id 和 secret_access_key".to_string());
                }
            }
            CredentialsMode::Endpoint => {
                if self.endpoint_url.as_deref().unwrap_or("").is_empty() {
                    return Err("endpoint 模式需要 endpoint_url".to_string());
                }
            }
            CredentialsMode::Environment => {}
        }
        if self.auth_retries == 0 {
            return Err("凭证获取次数不能为 0".to_string());
        }
        Ok(())
    }
}

impl AppConfig {
    /// 校验整个配置
    pub fn validate(&self) -> Result<()> {
        self.upload
            .validate()
            .map_err(|e| anyhow::anyhow!("上传配置无效: {}", e))?;
        self.credentials
            .validate()
            .map_err(|e| anyhow::anyhow!("凭证配置无效: {}", e))?;
        if self.storage.region.is_empty() {
            anyhow::bail!("存储配置无效: region 不能为空");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 文件不存在时写出默认配置，已存在但解析失败时保留原文件
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.min_part_size, 5 * 1024 * 1024);
        assert_eq!(config.upload.max_part_count, 10_000);
        assert_eq!(config.upload.max_concurrent_parts, 4);
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.credentials.mode, CredentialsMode::Environment);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.storage.bucket = Some("my-bucket".to_string());
        config.storage.base_key = Some("uploads".to_string());
        config.upload.max_concurrent_parts = 8;

        config.save_to_file(path).await.unwrap();
        let loaded = AppConfig::load_from_file(path).await.unwrap();

        assert_eq!(loaded.storage.bucket.as_deref(), Some("my-bucket"));
        assert_eq!(loaded.storage.base_key.as_deref(), Some("uploads"));
        assert_eq!(loaded.upload.max_concurrent_parts, 8);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let content = r#"
[storage]
region = "ap-southeast-1"
bucket = "media"

[credentials]
mode = "endpoint"
endpoint_url = "https://auth.example.com/credentials"
"#;
        let config: AppConfig = toml::from_str(content).unwrap();

        assert_eq!(config.storage.region, "ap-southeast-1");
        assert_eq!(config.storage.request_timeout_secs, 300);
        assert_eq!(config.upload.backoff_base_ms, 500);
        assert_eq!(config.upload.backoff_max_ms, 8_000);
        assert_eq!(config.credentials.mode, CredentialsMode::Endpoint);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.upload.min_part_size = 10;
        config.upload.max_part_size = 5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.max_concurrent_parts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.credentials.mode = CredentialsMode::Static;
        assert!(config.validate().is_err());
        config.credentials.access_key_id = Some("AK".to_string());
        config.credentials.secret_access_key = Some("SK".to_string());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.upload.max_retries, 3);
        assert!(std::path::Path::new(path).exists());
    }
}
