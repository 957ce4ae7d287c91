//! 指数退避重试策略
//!
//! 基于 backoff crate 的 `ExponentialBackoff`，额外加上最大尝试次数的限制。
//! 所有远程连接的重试都统一走 [`RetryPolicy::retry`]，调用方不再各自写循环。

use backoff::{Error as BackoffError, ExponentialBackoff, future::retry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// 重试策略配置（可序列化，来自 `[ssh.retry]`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 500,
            max_interval_ms: 8_000,
            multiplier: 2.0,
            randomization_factor: 0.1,
        }
    }
}

/// 重试策略对象：最大尝试次数 + 退避函数
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 执行操作：仅对 `is_transient` 判定为瞬态的错误重试，且总尝试次数不超过上限
    pub async fn retry<F, Fut, T, E>(
        &self,
        operation: F,
        is_transient: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display + Send + 'static,
    {
        let attempts = Arc::new(AtomicU32::new(0));
        let max_attempts = self.max_attempts;
        let counter = attempts.clone();
        let classify = Arc::new(move |e: &E| {
            let attempt = counter.load(Ordering::SeqCst);
            if !is_transient(e) {
                return false;
            }
            if attempt >= max_attempts {
                return false;
            }
            warn!(attempt, max_attempts, error = %e, "transient failure, backing off");
            true
        });

        let mut op = operation;
        let counted = move || {
            attempts.fetch_add(1, Ordering::SeqCst);
            op()
        };

        execute_with_backoff_selective(counted, self.backoff.clone(), classify).await
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(cfg.initial_interval_ms),
            current_interval: Duration::from_millis(cfg.initial_interval_ms),
            max_interval: Duration::from_millis(cfg.max_interval_ms),
            multiplier: cfg.multiplier,
            randomization_factor: cfg.randomization_factor,
            // 次数由 max_attempts 控制
            max_elapsed_time: None,
            ..Default::default()
        };
        RetryPolicy::new(cfg.max_attempts, backoff)
    }
}

/// 带错误分类的重试：仅对被判定为“瞬态”的错误进行重试；否则立即失败
async fn execute_with_backoff_selective<F, Fut, T, E>(
    mut operation: F,
    backoff: ExponentialBackoff,
    is_transient: Arc<dyn Fn(&E) -> bool + Send + Sync + 'static>,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display + Send + 'static,
{
    let wrapped_operation = move || {
        let fut = operation();
        let classify = is_transient.clone();
        async move {
            match fut.await {
                Ok(v) => Ok(v),
                Err(e) => {
                    if (classify)(&e) {
                        Err(BackoffError::transient(e))
                    } else {
                        Err(BackoffError::permanent(e))
                    }
                }
            }
        }
    };

    retry(backoff, wrapped_operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from(&RetryConfig {
            max_attempts,
            initial_interval_ms: 1,
            max_interval_ms: 2,
            multiplier: 1.0,
            randomization_factor: 0.0,
        })
    }

    #[tokio::test]
    async fn test_transient_errors_stop_at_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<(), String> = quick_policy(4)
            .retry(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("unreachable".to_string())
                    }
                },
                |_| true,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<(), String> = quick_policy(5)
            .retry(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("auth".to_string())
                    }
                },
                |e: &String| e != "auth",
            )
            .await;
        assert_eq!(result, Err("auth".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let result: Result<u32, String> = quick_policy(3)
            .retry(
                move || {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("flaky".to_string())
                        } else {
                            Ok(7)
                        }
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(0, ExponentialBackoff::default());
        assert_eq!(policy.max_attempts(), 1);
    }
}
