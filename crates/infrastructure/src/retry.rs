use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

#[derive(Clone, Debug)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            base,
            max: Duration::MAX,
        }
    }

    /// 指数退避，单次等待不超过 `max`
    pub fn capped(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// 第 `attempt` 次失败后的等待时间，从 1 开始计数
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_redis_config(config: &config::RedisConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts.max(1),
            backoff: Backoff::capped(
                Duration::from_millis(config.reconnect_interval_ms),
                Duration::from_millis(config.max_reconnect_delay_ms),
            ),
        }
    }
}

pub async fn retry_async<F, Fut, T, E>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.backoff.delay_at(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "操作失败，稍后重试");
                sleep(delay).await;
            }
        }
    }
}

/// 不限次数地重试直到成功，等待时间按 `backoff` 增长并封顶
pub async fn retry_forever<F, Fut, T, E>(backoff: &Backoff, operation: &str, mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match op().await {
            Ok(v) => return v,
            Err(e) => {
                let delay = backoff.delay_at(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "操作失败，稍后重试");
                sleep(delay).await;
            }
        }
    }
}
