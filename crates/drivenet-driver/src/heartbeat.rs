//! 连接监控 - 记录距对端上一次存活信号的时间
//!
//! [`RemoteDriver`](crate::RemoteDriver) 用它判断从机是否在线（任何入站消息都算），
//! 从机模式看门狗用它记录外部命令。
//!
//! **应用启动相对时间模式**：
//! - 以应用启动时刻为锚点的单调时间
//! - 不受系统时钟调整（NTP、手动修改）影响
//! - 可存入 AtomicU64 无锁访问

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 单调时间的全局锚点
static APP_START: OnceLock<Instant> = OnceLock::new();

/// 自应用启动以来的单调时间（微秒）
fn get_monotonic_micros() -> u64 {
    let start = APP_START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// 存活监控
pub struct ConnectionMonitor {
    last_feedback: AtomicU64,
    timeout: Duration,
}

impl ConnectionMonitor {
    /// 创建监控器，计时从现在开始
    ///
    /// # 示例
    /// ```
    /// # use drivenet_driver::heartbeat::ConnectionMonitor;
    /// # use std::time::Duration;
    /// let monitor = ConnectionMonitor::new(Duration::from_millis(1500));
    /// assert!(monitor.check_connection());
    /// ```
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_feedback: AtomicU64::new(get_monotonic_micros()),
            timeout,
        }
    }

    /// 超时窗口内是否收到过反馈
    pub fn check_connection(&self) -> bool {
        self.time_since_last_feedback() < self.timeout
    }

    /// 记录一次存活信号
    pub fn register_feedback(&self) {
        self.last_feedback.store(get_monotonic_micros(), Ordering::Relaxed);
    }

    /// 距上一次反馈的时间
    pub fn time_since_last_feedback(&self) -> Duration {
        let last_us = self.last_feedback.load(Ordering::Relaxed);
        let now_us = get_monotonic_micros();
        Duration::from_micros(now_us.saturating_sub(last_us))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
