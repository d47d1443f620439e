//! 临时凭证
//!
//! 凭证由外部身份服务签发，有效期有限。上传过程中所有分片共享同一份凭证，
//! 过期时由 [`CredentialCache`] 统一刷新。

mod cache;
mod provider;

pub use cache::{CachedCredentials, CredentialCache};
pub use provider::{EndpointCredentialProvider, EnvCredentialProvider, StaticCredentialProvider};

use crate::config::{CredentialsConfig, CredentialsMode};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 访问凭证
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// 临时凭证的会话令牌
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// 过期时间，None 表示长期凭证
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expiry: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// 是否将在 `window` 内过期
    pub fn expires_within(&self, window: chrono::Duration) -> bool {
        match self.expiry {
            Some(expiry) => expiry - Utc::now() <= window,
            None => false,
        }
    }
}

// 不打印密钥
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// 凭证提供者
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// 获取凭证
    async fn get_credentials(&self) -> anyhow::Result<Credentials>;

    /// 强制重新获取凭证
    async fn refresh(&self) -> anyhow::Result<Credentials> {
        self.get_credentials().await
    }
}

/// 按配置创建凭证提供者
pub fn provider_from_config(config: &CredentialsConfig) -> anyhow::Result<Arc<dyn CredentialProvider>> {
    let provider: Arc<dyn CredentialProvider> = match config.mode {
        CredentialsMode::Static => {
            let access_key_id = config
                .access_key_id
                .clone()
                .context("static 模式缺少 access_key_id")?;
            let secret_access_key = config
                .secret_access_key
                .clone()
                .context("static 模式缺少 secret_access_key")?;
            let mut credentials = Credentials::new(access_key_id, secret_access_key);
            credentials.session_token = config.session_token.clone();
            Arc::new(StaticCredentialProvider::new(credentials))
        }
        CredentialsMode::Environment => Arc::new(EnvCredentialProvider),
        CredentialsMode::Endpoint => {
            let url = config
                .endpoint_url
                .clone()
                .context("endpoint 模式缺少 endpoint_url")?;
            Arc::new(EndpointCredentialProvider::new(url, config.bearer_token.clone())?)
        }
    };
    Ok(provider)
}

/// 按配置创建凭证缓存
pub fn cache_from_config(config: &CredentialsConfig) -> anyhow::Result<CredentialCache> {
    let provider = provider_from_config(config)?;
    Ok(CredentialCache::new(provider)
        .with_max_attempts(config.auth_retries)
        .with_refresh_window(chrono::Duration::seconds(config.refresh_window_secs)))
}
