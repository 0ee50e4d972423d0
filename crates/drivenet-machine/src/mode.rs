//! 工作模式
//!
//! 三种模式以组合方式实现同一个 [`Mode`] trait：
//!
//! - [`StandaloneMode`]: 无后台任务
//! - [`MasterMode`]: 运行主机协调循环，把本地写入的命令键转发给所有从机
//! - [`SlaveMode`]: 运行命令看门狗，外部写入时复位看门狗
//!
//! 模式转换（前置条件检查、会话创建）由 [`Machine`](crate::Machine) 负责；
//! 模式对象只管理自己的后台任务，`shutdown()` 返回后所有后台线程都已退出。

use crate::circuit::FatalEvent;
use crate::error::MachineError;
use crate::guard::GuardedValues;
use crate::master::{MasterLoop, SlaveTable};
use crate::submode::is_always_forward;
use crate::watchdog::{Watchdog, WatchdogState};
use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use drivenet_driver::{Driver, JoinTimeout, Value};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{JoinHandle, spawn};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 模式种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeKind {
    Standalone,
    Master,
    Slave,
}

impl ModeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModeKind::Standalone => "standalone",
            ModeKind::Master => "master",
            ModeKind::Slave => "slave",
        }
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模式转换请求
///
/// 文本形式：`"standalone"`、`"master"`、`"slave"`、`"slave 10.0.0.1:6969"`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeRequest {
    Standalone,
    Master,
    Slave { master: Option<String> },
}

impl ModeRequest {
    pub fn slave(master: impl Into<String>) -> Self {
        ModeRequest::Slave {
            master: Some(master.into()),
        }
    }

    pub fn kind(&self) -> ModeKind {
        match self {
            ModeRequest::Standalone => ModeKind::Standalone,
            ModeRequest::Master => ModeKind::Master,
            ModeRequest::Slave { .. } => ModeKind::Slave,
        }
    }
}

impl FromStr for ModeRequest {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let name = parts.next().map(str::to_ascii_lowercase);
        let arg = parts.next();
        if parts.next().is_some() {
            return Err(MachineError::InvalidMode(s.to_string()));
        }

        match (name.as_deref(), arg) {
            (Some("standalone"), None) => Ok(ModeRequest::Standalone),
            (Some("master"), None) => Ok(ModeRequest::Master),
            (Some("slave"), master) => Ok(ModeRequest::Slave {
                master: master.map(|m| m.trim_start_matches("master=").to_string()),
            }),
            _ => Err(MachineError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeRequest::Slave {
                master: Some(master),
            } => write!(f, "slave {master}"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// 工作模式接口
pub trait Mode: Send {
    fn kind(&self) -> ModeKind;

    /// 从机模式下的主机地址
    fn master(&self) -> Option<&str> {
        None
    }

    /// 外部写入前调用（写入尚未生效）
    fn before_write(&self, key: &str) -> Result<(), MachineError> {
        let _ = key;
        Ok(())
    }

    /// 外部写入 `machine:` 键成功后调用
    fn after_write(&self, key: &str, value: &Value) {
        let _ = (key, value);
    }

    fn watchdog(&self) -> Option<&WatchdogState> {
        None
    }

    /// 停止后台任务（幂等）
    fn shutdown(&mut self);
}

// ==================== Standalone ====================

pub struct StandaloneMode;

impl Mode for StandaloneMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Standalone
    }

    fn shutdown(&mut self) {}
}

// ==================== Master ====================

/// 主机模式
///
/// 会话表由 `Machine` 在进入模式前建立并启动；退出时由本对象停止全部会话。
pub struct MasterMode {
    sessions: Arc<ArcSwap<SlaveTable>>,
    guard: Arc<Mutex<GuardedValues>>,
    fatal: Arc<FatalEvent>,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl MasterMode {
    pub fn start(
        driver: Arc<dyn Driver>,
        sessions: Arc<ArcSwap<SlaveTable>>,
        guard: Arc<Mutex<GuardedValues>>,
        fatal: Arc<FatalEvent>,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let coordinator = MasterLoop::new(driver, sessions.clone(), guard.clone(), fatal.clone());
        let thread = spawn(move || coordinator.run(shutdown_rx, interval));
        info!(slaves = sessions.load().len(), ?interval, "master loop started");

        Self {
            sessions,
            guard,
            fatal,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
            join_timeout: interval + Duration::from_secs(2),
        }
    }
}

impl Mode for MasterMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Master
    }

    fn after_write(&self, key: &str, value: &Value) {
        self.guard.lock().remember_static(key, value.clone());

        if key == "command:clear_errors" && value.as_bool() == Some(true) && self.fatal.is_set() {
            info!(reason = ?self.fatal.reason(), "fatal condition cleared");
            self.fatal.clear();
            for session in self.sessions.load().values() {
                session.reset_errors();
            }
        }

        if !is_always_forward(key) {
            return;
        }
        for session in self.sessions.load().values() {
            let slave = session.slave();
            let result = slave
                .transform_for(key)
                .apply(value)
                .map_err(MachineError::from)
                .and_then(|v| session.send_if_latest(key, v).map_err(MachineError::from));
            if let Err(e) = result {
                warn!(slave = %slave, key, error = %e, "failed to forward command");
            }
        }
    }

    fn shutdown(&mut self) {
        self.shutdown_tx.take();
        if let Some(handle) = self.thread.take()
            && let Err(_e) = handle.join_timeout(self.join_timeout)
        {
            error!("Master loop panicked or failed to shut down within {:?}", self.join_timeout);
        }

        let sessions = self.sessions.swap(Arc::new(SlaveTable::new()));
        for session in sessions.values() {
            session.exit();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "slave sessions stopped");
        }
    }
}

impl Drop for MasterMode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ==================== Slave ====================

/// 从机模式
pub struct SlaveMode {
    master: String,
    driver: Arc<dyn Driver>,
    watchdog: Watchdog,
    stopped: bool,
}

impl SlaveMode {
    pub fn start(driver: Arc<dyn Driver>, master: String, timeout: Duration) -> Self {
        let watchdog = Watchdog::spawn(driver.clone(), timeout);
        info!(%master, "following master");
        Self {
            master,
            driver,
            watchdog,
            stopped: false,
        }
    }
}

impl Mode for SlaveMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Slave
    }

    fn master(&self) -> Option<&str> {
        Some(&self.master)
    }

    fn before_write(&self, key: &str) -> Result<(), MachineError> {
        if self.watchdog.state().record_command() {
            info!(key, "command received after watchdog timeout, re-enabling drive");
            self.driver.set("command:enable", Value::Bool(true))?;
        }
        Ok(())
    }

    fn watchdog(&self) -> Option<&WatchdogState> {
        Some(self.watchdog.state())
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.watchdog.stop();
        if let Err(e) = self.driver.set("command:enable", Value::Bool(false)) {
            warn!(error = %e, "failed to disable drive when leaving slave mode");
        }
        debug!(master = %self.master, "slave mode stopped");
    }
}

impl Drop for SlaveMode {
    fn drop(&mut self) {
        self.shutdown();
    }
}
