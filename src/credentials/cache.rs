//! 凭证缓存与刷新协调
//!
//! 并发上传的分片共享同一份只读凭证。检测到凭证过期时，
//! 第一个发现者执行刷新，其余调用者等待这一次刷新的结果，
//! 而不是各自向提供者发起请求。

use super::{CredentialProvider, Credentials};
use crate::error::{Result, UploadError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// 默认提前刷新窗口（秒）
const DEFAULT_REFRESH_WINDOW_SECS: i64 = 60;

/// 默认获取凭证的最大尝试次数
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 失败重试的基础等待时间（毫秒）
const DEFAULT_RETRY_DELAY_MS: u64 = 200;

/// 带代数的凭证快照
///
/// 代数每次刷新加一，调用者用它判断自己持有的凭证是否已被替换。
#[derive(Debug, Clone)]
pub struct CachedCredentials {
    pub generation: u64,
    pub credentials: Arc<Credentials>,
}

/// 凭证缓存
pub struct CredentialCache {
    provider: Arc<dyn CredentialProvider>,
    /// 当前凭证
    current: RwLock<Option<CachedCredentials>>,
    /// 刷新锁，保证同一时刻只有一个刷新请求
    refresh_lock: Mutex<()>,
    /// 提前刷新窗口
    refresh_window: chrono::Duration,
    /// 单次刷新最大尝试次数
    max_attempts: u32,
    /// 重试基础等待时间
    retry_delay: Duration,
    /// 向提供者成功获取凭证的次数
    fetch_count: AtomicU64,
}

impl CredentialCache {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refresh_window: chrono::Duration::seconds(DEFAULT_REFRESH_WINDOW_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            fetch_count: AtomicU64::new(0),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_refresh_window(mut self, window: chrono::Duration) -> Self {
        self.refresh_window = window;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// 获取当前凭证，未获取过或即将过期时先刷新
    pub async fn current(&self) -> Result<CachedCredentials> {
        let cached = self.current.read().await.clone();
        match cached {
            Some(cached) if !cached.credentials.expires_within(self.refresh_window) => Ok(cached),
            Some(cached) => {
                debug!("凭证即将过期，提前刷新 (generation={})", cached.generation);
                self.refresh_after(cached.generation).await
            }
            None => self.refresh_after(0).await,
        }
    }

    /// 刷新过期凭证
    ///
    /// `stale_generation` 为调用者发现失效的凭证代数。
    /// 如果等待刷新锁期间已有其他调用者完成刷新，直接返回新凭证。
    pub async fn refresh_after(&self, stale_generation: u64) -> Result<CachedCredentials> {
        let _guard = self.refresh_lock.lock().await;

        let existing = self.current.read().await.clone();
        if let Some(cached) = &existing {
            if cached.generation > stale_generation {
                debug!(
                    "凭证已被其他任务刷新 (generation {} -> {})",
                    stale_generation, cached.generation
                );
                return Ok(cached.clone());
            }
        }

        let credentials = self.fetch(existing.is_none()).await?;

        let mut current = self.current.write().await;
        let generation = current.as_ref().map(|c| c.generation).unwrap_or(0) + 1;
        let cached = CachedCredentials {
            generation,
            credentials: Arc::new(credentials),
        };
        *current = Some(cached.clone());
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        info!(
            "凭证已更新: generation={}, access_key_id={}",
            generation, cached.credentials.access_key_id
        );
        Ok(cached)
    }

    /// 成功获取凭证的次数
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    async fn fetch(&self, initial: bool) -> Result<Credentials> {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let result = if initial {
                self.provider.get_credentials().await
            } else {
                self.provider.refresh().await
            };

            match result {
                Ok(credentials) => return Ok(credentials),
                Err(e) => {
                    warn!(
                        "获取凭证失败 ({}/{}): {:#}",
                        attempt, self.max_attempts, e
                    );
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }

        let reason = last_error
            .map(|e| format!("{:#}", e))
            .unwrap_or_else(|| "未知错误".to_string());
        Err(UploadError::Auth(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    /// 记录调用次数的提供者
    struct CountingProvider {
        get_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        delay: Duration,
        lifetime: Option<chrono::Duration>,
    }

    impl CountingProvider {
        fn new(delay: Duration) -> Self {
            Self {
                get_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                delay,
                lifetime: None,
            }
        }

        fn issue(&self, n: usize) -> Credentials {
            let mut creds = Credentials::new(format!("AK{}", n), "SK");
            if let Some(lifetime) = self.lifetime {
                creds.expiry = Some(Utc::now() + lifetime);
            }
            creds
        }
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn get_credentials(&self) -> anyhow::Result<Credentials> {
            let n = self.get_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.issue(n))
        }

        async fn refresh(&self) -> anyhow::Result<Credentials> {
            tokio::time::sleep(self.delay).await;
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.issue(100 + n))
        }
    }

    struct FailingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for FailingProvider {
        async fn get_credentials(&self) -> anyhow::Result<Credentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("identity service unavailable")
        }
    }

    #[tokio::test]
    async fn test_initial_fetch_is_cached() {
        let provider = Arc::new(CountingProvider::new(Duration::ZERO));
        let cache = CredentialCache::new(provider.clone());

        let first = cache.current().await.unwrap();
        let second = cache.current().await.unwrap();

        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 1);
        assert_eq!(provider.get_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_flight() {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(50)));
        let cache = Arc::new(CredentialCache::new(provider.clone()));

        let initial = cache.current().await.unwrap();
        assert_eq!(initial.generation, 1);
        let stale = initial.generation;

        // 8 个分片同时发现凭证过期
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.refresh_after(stale).await }));
        }

        for handle in handles {
            let refreshed = handle.await.unwrap().unwrap();
            assert_eq!(refreshed.generation, 2);
            assert_eq!(refreshed.credentials.access_key_id, "AK100");
        }

        // 只向提供者发起一次刷新
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_proactive_refresh_before_expiry() {
        let mut provider = CountingProvider::new(Duration::ZERO);
        provider.lifetime = Some(chrono::Duration::seconds(10));
        let provider = Arc::new(provider);
        let cache = CredentialCache::new(provider.clone())
            .with_refresh_window(chrono::Duration::seconds(60));

        let first = cache.current().await.unwrap();
        assert_eq!(first.generation, 1);

        // 剩余有效期小于刷新窗口，再次获取时触发刷新
        let second = cache.current().await.unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_becomes_auth_error() {
        let provider = Arc::new(FailingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = CredentialCache::new(provider.clone())
            .with_max_attempts(3)
            .with_retry_delay(Duration::from_millis(1));

        let err = cache.current().await.unwrap_err();

        assert!(matches!(err, UploadError::Auth(_)));
        assert!(err.to_string().contains("identity service unavailable"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }
}
