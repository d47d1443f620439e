// 凭证提供者实现

use super::{CredentialProvider, Credentials};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// 固定凭证
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// 从环境变量读取凭证
///
/// 读取 `AWS_ACCESS_KEY_ID`、`AWS_SECRET_ACCESS_KEY`、`AWS_SESSION_TOKEN`，
/// 每次刷新都重新读取。
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_credentials(&self) -> Result<Credentials> {
        let access_key_id =
            std::env::var("AWS_ACCESS_KEY_ID").context("环境变量 AWS_ACCESS_KEY_ID 未设置")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("环境变量 AWS_SECRET_ACCESS_KEY 未设置")?;

        let mut credentials = Credentials::new(access_key_id, secret_access_key);
        if let Ok(token) = std::env::var("AWS_SESSION_TOKEN") {
            if !token.is_empty() {
                credentials.session_token = Some(token);
            }
        }
        Ok(credentials)
    }
}

/// 凭证接口响应（与服务端批次信息字段一致）
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointCredentialsResponse {
    aws_secret_key_id: String,
    aws_secret_access_key: String,
    #[serde(default)]
    aws_session_token: Option<String>,
    /// 过期时间（Unix 毫秒时间戳）
    #[serde(default)]
    expiration: Option<i64>,
}

impl EndpointCredentialsResponse {
    fn into_credentials(self) -> Result<Credentials> {
        let mut credentials = Credentials::new(self.aws_secret_key_id, self.aws_secret_access_key);
        credentials.session_token = self.aws_session_token.filter(|t| !t.is_empty());
        if let Some(ms) = self.expiration {
            let expiry = Utc
                .timestamp_millis_opt(ms)
                .single()
                .with_context(|| format!("凭证过期时间非法: {}", ms))?;
            credentials.expiry = Some(expiry);
        }
        Ok(credentials)
    }
}

/// 从 HTTP 接口获取临时凭证
///
/// 服务端负责向身份服务换取短期凭证，客户端只拿到有时效的密钥。
#[derive(Debug, Clone)]
pub struct EndpointCredentialProvider {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl EndpointCredentialProvider {
    pub fn new(url: impl Into<String>, bearer_token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            bearer_token,
        })
    }
}

#[async_trait]
impl CredentialProvider for EndpointCredentialProvider {
    async fn get_credentials(&self) -> Result<Credentials> {
        debug!("请求临时凭证: {}", self.url);

        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("凭证请求发送失败")?;
        let status = response.status();
        let body = response.text().await.context("读取凭证响应失败")?;
        if !status.is_success() {
            anyhow::bail!("凭证接口返回错误: status={}, body={}", status, body);
        }

        let parsed: EndpointCredentialsResponse = serde_json::from_str(&body)
            .with_context(|| format!("解析凭证响应失败: status={}", status))?;
        let credentials = parsed.into_credentials()?;

        info!(
            "获取临时凭证成功: access_key_id={}, 过期时间={:?}",
            credentials.access_key_id, credentials.expiry
        );
        Ok(credentials)
    }
}
