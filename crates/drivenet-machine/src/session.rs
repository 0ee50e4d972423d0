//! 从机会话
//!
//! 一个 [`SlaveSession`] 对应一台受主机控制的从机，所有到该从机的流量都经过它：
//!
//! - **桥接线程**：按入队顺序从桥接队列取出 [`SlaveRequest`]，执行驱动调用，回调结果
//! - **巡检线程**：按刷新周期运行；空闲超过保活间隔时重推已缓存的子模式键，
//!   全局致命事件置位时进入"始终失能"分支
//!
//! 会话维护"最后推送值"缓存，[`SlaveSession::send_if_latest`] 只在值变化时发送
//! （[`ALWAYS_FORWARD`](crate::submode::ALWAYS_FORWARD) 中的命令键除外）。
//!
//! # 生命周期
//!
//! `start()` 连接驱动并启动两个线程；`exit()` 清除运行标志、唤醒并 join 两个线程、
//! 断开驱动。`exit()` 返回后不会再有任何发送，可重复调用。

use crate::circuit::{CircuitBreaker, FatalEvent};
use crate::error::SlaveMachineError;
use crate::slave::Slave;
use crate::submode::is_always_forward;
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use drivenet_driver::{ConnectionMonitor, Driver, DriverError, JoinTimeout, Value};
use drivenet_protocol::RequestId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 阻塞调用在请求截止时间之外额外等待的时间（覆盖桥接线程的调度延迟）
const BLOCKING_GRACE: Duration = Duration::from_millis(50);

/// 请求完成回调
pub type Callback<T> = Box<dyn FnOnce(Result<T, SlaveMachineError>) + Send>;

/// 会话参数
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// 巡检周期
    pub refresh_interval: Duration,
    /// 阻塞读写的等待时间
    pub request_timeout: Duration,
    /// 桥接线程的队列等待上限
    pub bridge_poll_interval: Duration,
    /// 超过该时间没有推送时重推缓存值
    pub keepalive_interval: Duration,
    /// 连续错误阈值
    pub error_threshold: u32,
    /// 桥接队列容量
    pub queue_capacity: usize,
    /// 熔断时是否置位全局致命事件
    pub escalate_fatal: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(250),
            request_timeout: Duration::from_millis(500),
            bridge_poll_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(500),
            error_threshold: 5,
            queue_capacity: 64,
            escalate_fatal: true,
        }
    }
}

/// 请求种类（各自携带类型化的完成回调）
pub enum RequestKind {
    Get {
        key: String,
        reply: Option<Callback<Value>>,
    },
    Set {
        key: String,
        value: Value,
        reply: Option<Callback<()>>,
    },
    Ping {
        timeout: Duration,
        reply: Callback<Duration>,
    },
}

impl RequestKind {
    fn describe(&self) -> String {
        match self {
            RequestKind::Get { key, .. } => format!("get {key}"),
            RequestKind::Set { key, value, .. } => format!("set {key}={value}"),
            RequestKind::Ping { .. } => "ping".to_string(),
        }
    }

    /// 不执行，直接以错误完成
    fn fail(self, err: SlaveMachineError) {
        match self {
            RequestKind::Get { reply: Some(reply), .. } => reply(Err(err)),
            RequestKind::Set { reply: Some(reply), .. } => reply(Err(err)),
            RequestKind::Ping { reply, .. } => reply(Err(err)),
            _ => {},
        }
    }
}

/// 桥接队列中的一条请求
pub struct SlaveRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    /// 过期的请求不再执行
    pub deadline: Option<Instant>,
}

enum BridgeItem {
    Request(SlaveRequest),
    /// 唤醒桥接线程以便及时观察到运行标志
    Wake,
}

#[derive(Debug, Default)]
struct SessionCounters {
    sent: AtomicU64,
    suppressed: AtomicU64,
    errors: AtomicU64,
    /// 最近一次 ping 延迟（微秒，0 表示尚无）
    last_ping_us: AtomicU64,
}

/// 会话统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    /// 已执行成功的写请求
    pub sent: u64,
    /// 因值未变化而跳过的推送
    pub suppressed: u64,
    /// 失败的请求
    pub errors: u64,
    pub consecutive_errors: u32,
    pub last_ping: Option<Duration>,
    /// 队列中尚未执行的请求
    pub queued: usize,
}

/// 从机会话
pub struct SlaveSession {
    slave: ArcSwap<Slave>,
    driver: Arc<dyn Driver>,
    settings: SessionSettings,
    queue_tx: Sender<BridgeItem>,
    queue_rx: Receiver<BridgeItem>,
    /// 目标键 → 最后推送值
    cache: Mutex<HashMap<String, Value>>,
    breaker: CircuitBreaker,
    fatal: Arc<FatalEvent>,
    /// 最近一次入队推送的时间（保活计时）
    last_push: ConnectionMonitor,
    is_running: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    counters: SessionCounters,
}

impl SlaveSession {
    pub fn new(
        slave: Slave,
        driver: Arc<dyn Driver>,
        settings: SessionSettings,
        fatal: Arc<FatalEvent>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(settings.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        Arc::new(Self {
            slave: ArcSwap::from_pointee(slave),
            driver,
            breaker: CircuitBreaker::new(settings.error_threshold),
            last_push: ConnectionMonitor::new(settings.keepalive_interval),
            settings,
            queue_tx,
            queue_rx,
            cache: Mutex::new(HashMap::new()),
            fatal,
            is_running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            threads: Mutex::new(Vec::new()),
            counters: SessionCounters::default(),
        })
    }

    /// 当前从机记录
    pub fn slave(&self) -> Arc<Slave> {
        self.slave.load_full()
    }

    /// 替换从机记录（如子模式变化），清空推送缓存以便下一周期全量推送
    pub fn replace_slave(&self, slave: Slave) {
        info!(slave = %slave, submode = %slave.submode(), "slave record replaced");
        self.slave.store(Arc::new(slave));
        self.cache.lock().clear();
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 连接驱动并启动桥接线程与巡检线程
    ///
    /// 已启动时直接返回；`exit()` 之后不能再次启动。
    pub fn start(self: &Arc<Self>) -> Result<(), SlaveMachineError> {
        if self.shutdown_tx.lock().is_none() {
            return Err(self.stopped());
        }
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.driver.connect() {
            self.is_running.store(false, Ordering::Release);
            return Err(self.driver_error(e));
        }
        self.last_push.register_feedback();

        let bridge = {
            let session = self.clone();
            spawn(move || session.bridge_loop())
        };
        let watcher = {
            let session = self.clone();
            spawn(move || session.watcher_loop())
        };
        self.threads.lock().extend([bridge, watcher]);

        info!(slave = %self.slave(), "slave session started");
        Ok(())
    }

    /// 停止会话（幂等）
    pub fn exit(&self) {
        let was_running = self.is_running.swap(false, Ordering::AcqRel);

        // 丢弃发送端以唤醒巡检线程；再投递一个唤醒项给桥接线程
        self.shutdown_tx.lock().take();
        let _ = self.queue_tx.try_send(BridgeItem::Wake);

        // 先断开驱动：正在进行的请求立即以 Closed 结束，不必等满超时
        self.driver.exit();

        let join_timeout =
            self.settings.request_timeout + self.settings.refresh_interval + Duration::from_secs(1);
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if let Err(_e) = handle.join_timeout(join_timeout) {
                error!(
                    slave = %self.slave(),
                    "Session thread panicked or failed to shut down within {:?}", join_timeout
                );
            }
        }

        // 队列中剩余的请求以 Stopped 结束
        while let Ok(item) = self.queue_rx.try_recv() {
            if let BridgeItem::Request(request) = item {
                request.kind.fail(self.stopped());
            }
        }

        if was_running {
            info!(slave = %self.slave(), "slave session stopped");
        }
    }

    // ==================== 推送 ====================

    /// 值变化时推送到从机的 `dest_key`
    ///
    /// 返回 `Ok(true)` 表示已入队发送，`Ok(false)` 表示值与上次推送相同而跳过。
    /// 始终转发的命令键不经过变化抑制。
    pub fn send_if_latest(&self, dest_key: &str, value: Value) -> Result<bool, SlaveMachineError> {
        let mut cache = self.cache.lock();
        if !is_always_forward(dest_key) && cache.get(dest_key) == Some(&value) {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        self.enqueue(
            RequestKind::Set {
                key: dest_key.to_string(),
                value: value.clone(),
                reply: None,
            },
            None,
        )?;
        cache.insert(dest_key.to_string(), value);
        Ok(true)
    }

    /// 最后推送到 `dest_key` 的值
    pub fn cached(&self, dest_key: &str) -> Option<Value> {
        self.cache.lock().get(dest_key).cloned()
    }

    // ==================== 调用方接口 ====================

    /// 测量往返延迟，最多等待 `timeout`
    pub fn ping(&self, timeout: Duration) -> Result<Duration, SlaveMachineError> {
        self.blocking(timeout, "ping", |reply| RequestKind::Ping { timeout, reply })
    }

    /// 阻塞读取从机的一个键
    pub fn get_from_remote(&self, key: &str) -> Result<Value, SlaveMachineError> {
        self.blocking(self.settings.request_timeout, key, |reply| RequestKind::Get {
            key: key.to_string(),
            reply: Some(reply),
        })
    }

    /// 非阻塞读取，结果交给回调（在桥接线程上执行）
    pub fn get_from_remote_with(
        &self,
        key: &str,
        callback: impl FnOnce(Result<Value, SlaveMachineError>) + Send + 'static,
    ) -> Result<(), SlaveMachineError> {
        self.enqueue(
            RequestKind::Get {
                key: key.to_string(),
                reply: Some(Box::new(callback)),
            },
            None,
        )
    }

    /// 阻塞写入从机的一个键
    pub fn set_to_remote(&self, key: &str, value: Value) -> Result<(), SlaveMachineError> {
        self.blocking(self.settings.request_timeout, key, |reply| RequestKind::Set {
            key: key.to_string(),
            value,
            reply: Some(reply),
        })
    }

    /// 非阻塞写入，失败只记录日志与错误计数
    pub fn set_to_remote_detached(&self, key: &str, value: Value) -> Result<(), SlaveMachineError> {
        self.enqueue(
            RequestKind::Set {
                key: key.to_string(),
                value,
                reply: None,
            },
            None,
        )
    }

    pub fn stats(&self) -> SessionStats {
        let last_ping_us = self.counters.last_ping_us.load(Ordering::Relaxed);
        SessionStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            consecutive_errors: self.breaker.consecutive_errors(),
            last_ping: (last_ping_us > 0).then(|| Duration::from_micros(last_ping_us)),
            queued: self.queue_rx.len(),
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    /// 复位熔断器（清除错误后由主机调用）
    pub fn reset_errors(&self) {
        self.breaker.reset();
    }

    // ==================== 内部实现 ====================

    fn enqueue(&self, kind: RequestKind, deadline: Option<Instant>) -> Result<(), SlaveMachineError> {
        if !self.is_running() {
            return Err(self.stopped());
        }
        let is_push = matches!(kind, RequestKind::Set { .. });
        let request = SlaveRequest {
            id: RequestId::generate(),
            kind,
            deadline,
        };
        trace!(slave = %self.slave(), id = %request.id, request = %request.kind.describe(), "enqueue");

        match self.queue_tx.try_send(BridgeItem::Request(request)) {
            Ok(()) => {
                if is_push {
                    self.last_push.register_feedback();
                }
                Ok(())
            },
            Err(TrySendError::Full(_)) => Err(SlaveMachineError::QueueFull {
                slave: self.slave().to_string(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(self.stopped()),
        }
    }

    fn blocking<T: Send + 'static>(
        &self,
        timeout: Duration,
        what: &str,
        make: impl FnOnce(Callback<T>) -> RequestKind,
    ) -> Result<T, SlaveMachineError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let reply: Callback<T> = Box::new(move |result| {
            let _ = tx.send(result);
        });
        self.enqueue(make(reply), Some(Instant::now() + timeout))?;

        match rx.recv_timeout(timeout + BLOCKING_GRACE) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(self.timeout(what)),
            Err(RecvTimeoutError::Disconnected) => Err(self.stopped()),
        }
    }

    fn stopped(&self) -> SlaveMachineError {
        SlaveMachineError::Stopped {
            slave: self.slave().to_string(),
        }
    }

    fn timeout(&self, what: &str) -> SlaveMachineError {
        SlaveMachineError::Timeout {
            slave: self.slave().to_string(),
            what: what.to_string(),
        }
    }

    fn driver_error(&self, source: DriverError) -> SlaveMachineError {
        SlaveMachineError::Driver {
            slave: self.slave().to_string(),
            source,
        }
    }

    fn classify(&self, e: DriverError, what: &str) -> SlaveMachineError {
        if e.is_timeout() {
            self.timeout(what)
        } else {
            self.driver_error(e)
        }
    }

    /// 桥接线程主循环
    fn bridge_loop(self: Arc<Self>) {
        loop {
            if !self.is_running() {
                break;
            }
            let item = match self.queue_rx.recv_timeout(self.settings.bridge_poll_interval) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let BridgeItem::Request(request) = item else {
                continue;
            };
            if !self.is_running() {
                request.kind.fail(self.stopped());
                break;
            }
            self.execute(request);
        }
        trace!(slave = %self.slave(), "bridge loop exited");
    }

    fn execute(&self, request: SlaveRequest) {
        let SlaveRequest { id, kind, deadline } = request;
        let what = kind.describe();
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            debug!(slave = %self.slave(), %id, request = %what, "request expired in queue");
            kind.fail(self.timeout(&what));
            return;
        }

        match kind {
            RequestKind::Get { key, reply } => {
                let result = self.driver.get(&key);
                self.account(&what, result.as_ref().err());
                if let Some(reply) = reply {
                    reply(result.map_err(|e| self.classify(e, &what)));
                }
            },
            RequestKind::Set { key, value, reply } => {
                let result = self.driver.set(&key, value.clone());
                self.account(&what, result.as_ref().err());
                match &result {
                    Ok(()) => {
                        self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    },
                    Err(_) => {
                        // 推送失败：作废缓存，下一周期重发
                        let mut cache = self.cache.lock();
                        if cache.get(&key) == Some(&value) {
                            cache.remove(&key);
                        }
                    },
                }
                if let Some(reply) = reply {
                    reply(result.map_err(|e| self.classify(e, &what)));
                }
            },
            RequestKind::Ping { timeout, reply } => {
                let remaining = deadline
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or(timeout);
                let result = self.driver.ping(remaining);
                self.account(&what, result.as_ref().err());
                if let Ok(latency) = &result {
                    let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX).max(1);
                    self.counters.last_ping_us.store(micros, Ordering::Relaxed);
                }
                reply(result.map_err(|e| self.classify(e, &what)));
            },
        }
    }

    /// 更新熔断器；超过阈值时强制失能从机并上报致命事件
    fn account(&self, what: &str, error: Option<&DriverError>) {
        let Some(error) = error else {
            self.breaker.record_success();
            return;
        };

        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        warn!(slave = %self.slave(), request = what, error = %error, "slave request failed");

        if self.breaker.record_error() || !self.breaker.trip() {
            return;
        }

        let slave = self.slave();
        let errors = self.breaker.consecutive_errors();
        error!(%slave, errors, "error threshold exceeded, force-disabling slave");
        if let Err(e) = self.driver.set("command:enable", Value::Bool(false)) {
            warn!(%slave, error = %e, "failed to disable slave");
        }
        self.cache
            .lock()
            .insert("command:enable".to_string(), Value::Bool(false));

        if self.settings.escalate_fatal {
            self.fatal.set(
                SlaveMachineError::Fatal {
                    slave: slave.to_string(),
                    errors,
                }
                .to_string(),
            );
        }
    }

    /// 巡检线程主循环
    fn watcher_loop(self: Arc<Self>) {
        loop {
            match self.shutdown_rx.recv_timeout(self.settings.refresh_interval) {
                Err(RecvTimeoutError::Timeout) => {},
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.is_running() {
                break;
            }

            if self.fatal.is_set() {
                // 安全分支：持续要求失能，直到致命事件被清除
                if let Err(e) = self.send_if_latest("command:enable", Value::Bool(false)) {
                    debug!(slave = %self.slave(), error = %e, "safe-disable push failed");
                }
                continue;
            }

            if !self.last_push.check_connection() {
                self.keepalive();
            }
        }
        trace!(slave = %self.slave(), "watcher loop exited");
    }

    /// 重推子模式键的缓存值，刷新从机看门狗
    fn keepalive(&self) {
        let slave = self.slave();
        let cached: Vec<(String, Value)> = {
            let cache = self.cache.lock();
            slave
                .submode()
                .forward_keys()
                .iter()
                .filter_map(|fk| cache.get(fk.dest).map(|v| (fk.dest.to_string(), v.clone())))
                .collect()
        };

        for (key, value) in cached {
            let push = RequestKind::Set {
                key,
                value,
                reply: None,
            };
            if let Err(e) = self.enqueue(push, None) {
                debug!(%slave, error = %e, "keepalive push failed");
                break;
            }
        }
        // 没有缓存值时也重置计时，避免每个周期都空转
        self.last_push.register_feedback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submode::Submode;
    use drivenet_driver::{DriverKind, VirtualDriver};

    fn settings() -> SessionSettings {
        SessionSettings {
            refresh_interval: Duration::from_millis(20),
            request_timeout: Duration::from_millis(200),
            bridge_poll_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(60),
            error_threshold: 3,
            queue_capacity: 16,
            escalate_fatal: true,
        }
    }

    fn session_with(settings: SessionSettings) -> (Arc<SlaveSession>, Arc<VirtualDriver>, Arc<FatalEvent>) {
        let drive = Arc::new(VirtualDriver::new());
        let fatal = Arc::new(FatalEvent::new());
        let slave = Slave::new(DriverKind::Virtual, "virtual:1", Submode::Velocity);
        let session = SlaveSession::new(slave, drive.clone(), settings, fatal.clone());
        (session, drive, fatal)
    }

    /// 等待桥接线程处理完队列
    fn settle(session: &SlaveSession) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while session.stats().queued > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(30));
    }

    fn writes_of(drive: &VirtualDriver, key: &str) -> Vec<Value> {
        drive
            .writes()
            .into_iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .collect()
    }

    #[test]
    fn test_send_if_latest_suppresses_unchanged_values() {
        let (session, drive, _) = session_with(settings());
        session.start().unwrap();

        assert!(session.send_if_latest("velocity_ref", Value::Float(20.0)).unwrap());
        assert!(!session.send_if_latest("velocity_ref", Value::Float(20.0)).unwrap());
        assert!(session.send_if_latest("velocity_ref", Value::Float(21.0)).unwrap());
        settle(&session);

        assert_eq!(
            writes_of(&drive, "velocity_ref"),
            vec![Value::Float(20.0), Value::Float(21.0)]
        );
        let stats = session.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.suppressed, 1);
        session.exit();
    }

    #[test]
    fn test_always_forward_keys_bypass_cache() {
        let (session, drive, _) = session_with(settings());
        session.start().unwrap();

        assert!(session.send_if_latest("command:enable", Value::Bool(true)).unwrap());
        assert!(session.send_if_latest("command:enable", Value::Bool(true)).unwrap());
        settle(&session);

        assert_eq!(writes_of(&drive, "command:enable").len(), 2);
        session.exit();
    }

    #[test]
    fn test_exit_is_idempotent_and_stops_sends() {
        let (session, drive, _) = session_with(settings());
        session.start().unwrap();
        assert!(session.is_running());

        session.exit();
        session.exit();

        assert!(!session.is_running());
        assert!(session.threads.lock().is_empty());
        assert!(matches!(
            session.send_if_latest("velocity_ref", Value::Float(1.0)),
            Err(SlaveMachineError::Stopped { .. })
        ));
        assert!(drive.writes().is_empty());
        assert!(matches!(session.start(), Err(SlaveMachineError::Stopped { .. })));
    }

    #[test]
    fn test_blocking_get_set_and_ping() {
        let (session, drive, _) = session_with(settings());
        session.start().unwrap();

        session.set_to_remote("torque_ref", Value::Float(0.4)).unwrap();
        assert_eq!(drive.peek("torque_ref"), Some(Value::Float(0.4)));
        assert_eq!(session.get_from_remote("torque_ref").unwrap(), Value::Float(0.4));
        assert!(session.ping(Duration::from_millis(200)).is_ok());
        assert!(session.stats().last_ping.is_some());

        let (tx, rx) = crossbeam_channel::bounded(1);
        session
            .get_from_remote_with("move_mode", move |r| {
                let _ = tx.send(r.is_ok());
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        session.exit();
    }

    #[test]
    fn test_application_errors_surface_to_caller() {
        let (session, _, _) = session_with(settings());
        session.start().unwrap();

        let err = session.set_to_remote("velocity", Value::Float(1.0)).unwrap_err();
        match err {
            SlaveMachineError::Driver { slave, source } => {
                assert_eq!(slave, "virtual:1");
                assert!(matches!(source, DriverError::ReadOnly(_)));
            },
            other => panic!("unexpected error: {other}"),
        }
        session.exit();
    }

    #[test]
    fn test_error_threshold_disables_slave_and_sets_fatal() {
        let (session, drive, fatal) = session_with(settings());
        session.start().unwrap();
        drive.set("command:enable", Value::Bool(true)).unwrap();

        for _ in 0..3 {
            let _ = session.set_to_remote("bogus", Value::Float(1.0));
        }

        assert!(session.is_tripped());
        assert_eq!(drive.peek("command:enable"), Some(Value::Bool(false)));
        assert!(fatal.is_set());
        assert!(fatal.reason().unwrap().contains("virtual:1"));
        session.exit();
    }

    #[test]
    fn test_fatal_event_forces_safe_disable() {
        let (session, drive, fatal) = session_with(settings());
        session.start().unwrap();
        drive.set("command:enable", Value::Bool(true)).unwrap();

        fatal.set("test");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(drive.peek("command:enable"), Some(Value::Bool(false)));
        session.exit();
    }

    #[test]
    fn test_keepalive_repushes_cached_submode_keys() {
        let (session, drive, _) = session_with(SessionSettings {
            keepalive_interval: Duration::from_millis(60),
            ..settings()
        });
        session.start().unwrap();

        session.send_if_latest("velocity_ref", Value::Float(5.0)).unwrap();
        std::thread::sleep(Duration::from_millis(250));

        assert!(writes_of(&drive, "velocity_ref").len() >= 2);
        session.exit();
    }

    #[test]
    fn test_replace_slave_clears_cache() {
        let (session, _, _) = session_with(settings());
        session.start().unwrap();
        session.send_if_latest("velocity_ref", Value::Float(5.0)).unwrap();
        assert_eq!(session.cached("velocity_ref"), Some(Value::Float(5.0)));

        let updated = session.slave().as_ref().clone().with_submode(Submode::Torque);
        session.replace_slave(updated);
        assert_eq!(session.slave().submode(), Submode::Torque);
        assert_eq!(session.cached("velocity_ref"), None);
        session.exit();
    }
}
