// 重试策略
//
// - 瞬时错误（网络、超时、5xx、限流）按指数退避重试
// - 退避延迟 = min(base * 2^retry, max)，再叠加 ±jitter 比例的随机抖动
// - 凭证过期：通过 CredentialCache 刷新后立即重试，不消耗重试次数
// - 其他错误立即失败

use crate::config::UploadConfig;
use crate::credentials::{CredentialCache, Credentials};
use crate::error::{Result, UploadError};
use crate::storage::StorageError;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 500;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 8_000;

/// 默认抖动比例
const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次尝试之外的最大重试次数
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// 抖动比例（0.2 表示 ±20%）
    pub jitter_ratio: f64,
    /// 凭证过期后最多刷新几次
    pub max_credential_refreshes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(INITIAL_BACKOFF_MS),
            backoff_max: Duration::from_millis(MAX_BACKOFF_MS),
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_credential_refreshes: 3,
        }
    }
}

impl From<&UploadConfig> for RetryPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            jitter_ratio: config.jitter_ratio,
            max_credential_refreshes: config.max_credential_refreshes,
        }
    }
}

impl RetryPolicy {
    /// 第 `retry` 次重试前的等待时间（含抖动）
    pub fn delay_for(&self, retry: u32) -> Duration {
        apply_jitter(
            backoff_delay(retry, self.backoff_base, self.backoff_max),
            self.jitter_ratio,
        )
    }
}

/// 计算指数退避延迟
///
/// # 延迟序列（默认参数）
/// - retry=0: 500ms
/// - retry=1: 1000ms
/// - retry=2: 2000ms
/// - retry=3: 4000ms
/// - 最大: 8000ms
pub fn backoff_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// 在 [delay * (1 - ratio), delay * (1 + ratio)] 内随机取值
pub fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
    delay.mul_f64(factor)
}

/// 等待指定时间，期间可被取消
async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(UploadError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// 按策略执行存储请求
///
/// 每次尝试都取缓存中的当前凭证。传入 `cancel` 时，
/// 请求进行中和退避等待中都会响应取消，进行中的请求结果被丢弃。
///
/// 失败时返回：
/// - `UploadError::Storage`：不可重试错误或重试耗尽
/// - `UploadError::Auth`：凭证刷新失败或连续过期次数超过上限
/// - `UploadError::Cancelled`
pub(crate) async fn run_with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    credentials: &CredentialCache,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(Arc<Credentials>) -> Fut,
    Fut: Future<Output = std::result::Result<T, StorageError>>,
{
    let mut cached = credentials.current().await?;
    let mut retry = 0u32;
    let mut refreshes = 0u32;

    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(UploadError::Cancelled);
        }

        let attempt = operation(cached.credentials.clone());
        let result = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(UploadError::Cancelled),
                result = attempt => result,
            },
            None => attempt.await,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if error.is_credentials_expired() {
            if refreshes >= policy.max_credential_refreshes {
                return Err(UploadError::Auth(format!(
                    "{}: 刷新 {} 次后凭证仍被拒绝: {}",
                    label, refreshes, error
                )));
            }
            refreshes += 1;
            warn!(
                "{} 凭证已过期，刷新后重试 ({}/{})",
                label, refreshes, policy.max_credential_refreshes
            );
            cached = credentials.refresh_after(cached.generation).await?;
            continue;
        }

        if !error.is_retriable() || retry >= policy.max_retries {
            return Err(UploadError::Storage(error));
        }

        let delay = policy.delay_for(retry);
        retry += 1;
        warn!(
            "{} 失败，等待 {}ms 后重试 ({}/{}): {}",
            label,
            delay.as_millis(),
            retry,
            policy.max_retries,
            error
        );
        sleep_or_cancel(delay, cancel).await?;
    }
}
