//! 有界指数退避重试
//!
//! 只重试 [`DriverError::is_retryable`] 为真的故障（传输层发送失败、未连接）。
//! 超时不在这里重试：超时由会话的熔断器计数，重试只会拉长单次调用的阻塞时间。

use crate::error::DriverError;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次），至少为 1
    pub max_attempts: u32,
    /// 第一次重试前的等待
    pub initial_backoff: Duration,
    /// 单次等待上限
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// 第 `attempt` 次失败后的等待时间（从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// 执行 `op`，对可重试错误按退避重试
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let wait = self.backoff(attempt);
                    debug!(what, attempt = attempt + 1, ?wait, error = %e, "retrying");
                    thread::sleep(wait);
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
