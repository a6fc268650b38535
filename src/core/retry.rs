//! 错误分级的重试控制
//!
//! 只有可恢复的失败才值得重试：连接超时、部分传输类退出码。
//! 认证失败与配置错误重试只会重复同样的结果，立即上抛。

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::core::executor::TransferResult;
use crate::error::SyncError;

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 退避序列：共 max_attempts - 1 个值，逐次乘以系数并封顶。
    /// 首次尝试没有延迟。
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let attempts = self.max_attempts.saturating_sub(1) as usize;
        let mut next = self.initial_delay;
        std::iter::from_fn(move || {
            let current = next;
            next = next.mul_f64(self.backoff_multiplier).min(self.max_delay);
            Some(current.min(self.max_delay))
        })
        .take(attempts)
    }
}

/// 重复调用执行器直到成功、不可恢复错误或尝试次数用尽
///
/// 每次重试前睡一个退避序列里的值；序列在整个循环里只推进，
/// 不会每次都从头取。次数耗尽时上抛最后一次的错误。
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    job_name: &str,
    mut attempt_fn: F,
) -> Result<TransferResult, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TransferResult, SyncError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays = policy.delays();
    let mut last_error: Option<SyncError> = None;

    for attempt in 1..=max_attempts {
        match attempt_fn().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_recoverable() {
                    return Err(e);
                }
                if attempt >= max_attempts {
                    error!(
                        "任务 '{}' 第 {} 次尝试仍失败，放弃重试: {}",
                        job_name, attempt, e
                    );
                    last_error = Some(e);
                    break;
                }
                let delay = delays.next().unwrap_or(policy.max_delay);
                warn!(
                    "任务 '{}' 第 {} 次尝试失败（{}），{:.1} 秒后重试",
                    job_name,
                    attempt,
                    e,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| SyncError::Config(format!("任务 '{}' 重试次数耗尽", job_name))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy_fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            backoff_multiplier: 2.0,
        }
    }

    fn ok_result() -> TransferResult {
        TransferResult {
            success: true,
            bytes_transferred: 0,
            duration_seconds: 0.0,
            log_lines: Vec::new(),
            error_message: None,
        }
    }

    #[test]
    fn test_delay_sequence_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_single_attempt_has_no_delays() {
        assert_eq!(policy_fast(1).delays().count(), 0);
    }

    #[tokio::test]
    async fn test_recoverable_failure_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&policy_fast(4), "job", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::transfer(23, "partial".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(SyncError::Transfer { exit_code, .. }) => assert_eq!(exit_code, 23),
            other => panic!("expected transfer error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_authentication_failure_never_retried() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&policy_fast(5), "job", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::Authentication("denied".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SyncError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_unrecoverable_exit_code_not_retried() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&policy_fast(5), "job", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::transfer(1, "usage".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SyncError::Transfer { .. })));
    }

    #[tokio::test]
    async fn test_timeout_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&policy_fast(3), "job", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(SyncError::Timeout {
                        host: "example.com".into(),
                        seconds: 30,
                    })
                } else {
                    Ok(ok_result())
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.is_ok());
    }
}
