//! 主机协调循环
//!
//! 每个刷新周期：对每个运行中的从机会话、其子模式下的每个转发键，
//!
//! 1. 经 [`GuardedValues`] 读取本地源键的权威值
//! 2. 应用该从机对目标键配置的变换规则
//! 3. 交给会话的 [`send_if_latest`](SlaveSession::send_if_latest)，由会话做变化抑制与发送
//!
//! 单个键或单台从机的失败只记录日志，循环继续。全局致命事件置位期间整个周期跳过，
//! 由各会话的巡检线程负责安全失能。

use crate::circuit::FatalEvent;
use crate::guard::GuardedValues;
use crate::session::SlaveSession;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use drivenet_driver::Driver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 从机身份 → 会话
pub type SlaveTable = HashMap<String, Arc<SlaveSession>>;

/// 一个周期的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sent: usize,
    pub suppressed: usize,
    pub errors: usize,
    /// 致命事件置位，周期被跳过
    pub skipped: bool,
}

#[derive(Clone)]
pub struct MasterLoop {
    driver: Arc<dyn Driver>,
    sessions: Arc<ArcSwap<SlaveTable>>,
    guard: Arc<Mutex<GuardedValues>>,
    fatal: Arc<FatalEvent>,
}

impl MasterLoop {
    pub fn new(
        driver: Arc<dyn Driver>,
        sessions: Arc<ArcSwap<SlaveTable>>,
        guard: Arc<Mutex<GuardedValues>>,
        fatal: Arc<FatalEvent>,
    ) -> Self {
        Self {
            driver,
            sessions,
            guard,
            fatal,
        }
    }

    /// 执行一个周期
    pub fn run_once(&self, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();
        if self.fatal.is_set() {
            report.skipped = true;
            return report;
        }

        let sessions = self.sessions.load();
        let mut guard = self.guard.lock();
        for session in sessions.values() {
            if !session.is_running() {
                continue;
            }
            let slave = session.slave();

            for key in slave.submode().forward_keys() {
                let value = match guard.read(key.source, now, |k| self.driver.get(k)) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(key = key.source, error = %e, "failed to read local value");
                        report.errors += 1;
                        continue;
                    },
                };

                let value = match slave.transform_for(key.dest).apply(&value) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(slave = %slave, key = key.dest, error = %e, "transform failed");
                        report.errors += 1;
                        continue;
                    },
                };

                match session.send_if_latest(key.dest, value) {
                    Ok(true) => report.sent += 1,
                    Ok(false) => report.suppressed += 1,
                    Err(e) => {
                        debug!(slave = %slave, key = key.dest, error = %e, "push failed");
                        report.errors += 1;
                    },
                }
            }
        }
        report
    }

    /// 按固定周期运行，直到 `shutdown_rx` 断开
    pub fn run(self, shutdown_rx: Receiver<()>, interval: Duration) {
        loop {
            let report = self.run_once(Instant::now());
            trace!(?report, "master cycle");

            match shutdown_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {},
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("master loop stopped");
    }
}
