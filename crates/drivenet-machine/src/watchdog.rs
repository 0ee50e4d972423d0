//! 从机模式命令看门狗
//!
//! 从机模式下，每一次真实的外部写入都视为主机的存活信号。`slave_timeout` 内没有写入
//! 且本地驱动处于使能状态时看门狗触发：失能驱动并置位超时标志。下一次外部写入先清除
//! 标志、恢复使能，再执行写入。
//!
//! 已经失能的驱动不会触发看门狗，空闲的从机不会产生一连串误报。

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use drivenet_driver::{ConnectionMonitor, Driver, JoinTimeout, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ENABLE_KEY: &str = "command:enable";

/// 看门狗线程的最短唤醒周期
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// 单次检查的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// 驱动已失能（或已触发）：无需看护
    Idle,
    /// 命令按时到达
    Healthy,
    /// 使能状态下超时：立即失能
    Trip,
}

/// 看门狗共享状态（计时器 + 超时标志）
pub struct WatchdogState {
    monitor: ConnectionMonitor,
    tripped: AtomicBool,
}

impl WatchdogState {
    pub fn new(timeout: Duration) -> Self {
        Self {
            monitor: ConnectionMonitor::new(timeout),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.monitor.timeout()
    }

    /// 记录一次真实的外部命令
    ///
    /// 看门狗已触发时返回 `true`；标志随即清除，由调用方恢复 `command:enable`。
    pub fn record_command(&self) -> bool {
        self.monitor.register_feedback();
        self.tripped.swap(false, Ordering::AcqRel)
    }

    /// 按当前使能状态评估计时器
    pub fn check(&self, drive_enabled: bool) -> WatchdogAction {
        if !drive_enabled || self.is_tripped() {
            return WatchdogAction::Idle;
        }
        if self.monitor.check_connection() {
            return WatchdogAction::Healthy;
        }
        // 每次超时只触发一次
        if self.tripped.swap(true, Ordering::AcqRel) {
            WatchdogAction::Idle
        } else {
            WatchdogAction::Trip
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn time_since_last_command(&self) -> Duration {
        self.monitor.time_since_last_feedback()
    }
}

/// 对本地驱动周期执行 [`WatchdogState::check`] 的后台线程
pub struct Watchdog {
    state: Arc<WatchdogState>,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// 启动看门狗线程，计时从现在开始
    pub fn spawn(driver: Arc<dyn Driver>, timeout: Duration) -> Self {
        let state = Arc::new(WatchdogState::new(timeout));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let interval = (timeout / 10).max(MIN_CHECK_INTERVAL);

        let thread = {
            let state = state.clone();
            spawn(move || watchdog_loop(driver, state, shutdown_rx, interval))
        };
        info!(?timeout, "slave watchdog started");

        Self {
            state,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    pub fn state(&self) -> &Arc<WatchdogState> {
        &self.state
    }

    /// 停止线程（幂等）
    pub fn stop(&mut self) {
        self.shutdown_tx.take();
        let timeout = self.state.timeout() + Duration::from_secs(1);
        if let Some(handle) = self.thread.take()
            && let Err(_e) = handle.join_timeout(timeout)
        {
            error!("Watchdog thread panicked or failed to shut down within {:?}", timeout);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watchdog_loop(
    driver: Arc<dyn Driver>,
    state: Arc<WatchdogState>,
    shutdown_rx: Receiver<()>,
    interval: Duration,
) {
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {},
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        // 读不到使能状态时按已使能处理
        let enabled = match driver.get(ENABLE_KEY) {
            Ok(value) => value.as_bool().unwrap_or(true),
            Err(e) => {
                debug!(error = %e, "watchdog could not read enable state");
                true
            },
        };

        if state.check(enabled) == WatchdogAction::Trip {
            error!(
                elapsed = ?state.time_since_last_command(),
                timeout = ?state.timeout(),
                "no command from master within slave timeout, disabling drive"
            );
            if let Err(e) = driver.set(ENABLE_KEY, Value::Bool(false)) {
                warn!(error = %e, "watchdog failed to disable drive");
            }
        }
    }
    debug!("slave watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivenet_driver::VirtualDriver;
    use std::thread::sleep;

    #[test]
    fn test_check_trips_once() {
        let state = WatchdogState::new(Duration::from_millis(20));
        assert_eq!(state.check(true), WatchdogAction::Healthy);
        sleep(Duration::from_millis(30));
        assert_eq!(state.check(false), WatchdogAction::Idle);
        assert_eq!(state.check(true), WatchdogAction::Trip);
        assert_eq!(state.check(true), WatchdogAction::Idle);
        assert!(state.is_tripped());

        assert!(state.record_command());
        assert!(!state.is_tripped());
        assert!(!state.record_command());
        assert_eq!(state.check(true), WatchdogAction::Healthy);
    }

    #[test]
    fn test_thread_disables_drive_on_timeout() {
        let drive = Arc::new(VirtualDriver::new());
        drive.set(ENABLE_KEY, Value::Bool(true)).unwrap();

        let mut watchdog = Watchdog::spawn(drive.clone(), Duration::from_millis(100));
        sleep(Duration::from_millis(300));

        assert_eq!(drive.peek(ENABLE_KEY), Some(Value::Bool(false)));
        assert!(watchdog.state().is_tripped());

        watchdog.stop();
        watchdog.stop();
    }

    #[test]
    fn test_disabled_drive_never_trips() {
        let drive = Arc::new(VirtualDriver::new());
        let watchdog = Watchdog::spawn(drive.clone(), Duration::from_millis(50));
        sleep(Duration::from_millis(150));
        assert!(!watchdog.state().is_tripped());
        assert!(drive.writes().is_empty());
    }
}
