//! 远端驱动：通过传输层访问另一台机器
//!
//! 每个 [`RemoteDriver`] 独占一个传输端点，并运行一个分发线程：
//! 接收入站消息 → 登记心跳 → 匹配挂起请求 → 清理到期请求。
//! 调用方线程只负责登记、发送、等待。

use crate::correlation::{PendingTable, Reply, ReplyHandle, Resolution};
use crate::error::{DriverError, RequestError};
use crate::heartbeat::ConnectionMonitor;
use crate::retry::RetryPolicy;
use crate::value::Value;
use crate::{AttributeMap, Driver, DriverKind, drive_attributes};
use drivenet_protocol::{Arg, Message, key_to_path};
use drivenet_transport::{JoinTimeout, Transport, TransportError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// 远端驱动配置
#[derive(Debug, Clone, Copy)]
pub struct RemoteConfig {
    /// 单次请求的默认超时
    pub request_timeout: Duration,
    /// 发送失败时的重试策略
    pub retry: RetryPolicy,
    /// 分发线程的最长接收等待（决定退出延迟）
    pub dispatch_poll: Duration,
    /// 多久没有收到任何消息视为失联
    pub liveness_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            dispatch_poll: Duration::from_millis(50),
            liveness_timeout: Duration::from_millis(1500),
        }
    }
}

/// 远端机器驱动
pub struct RemoteDriver {
    kind: DriverKind,
    transport: Arc<dyn Transport>,
    destination: Option<SocketAddr>,
    pending: Arc<PendingTable>,
    config: RemoteConfig,
    monitor: Arc<ConnectionMonitor>,
    is_running: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteDriver {
    /// 创建远端驱动（尚未连接）
    ///
    /// `destination` 为 `None` 表示点对点链路（串口）。
    pub fn new(
        kind: DriverKind,
        transport: Arc<dyn Transport>,
        destination: Option<SocketAddr>,
        config: RemoteConfig,
    ) -> Self {
        Self {
            kind,
            transport,
            destination,
            pending: Arc::new(PendingTable::new()),
            monitor: Arc::new(ConnectionMonitor::new(config.liveness_timeout)),
            config,
            is_running: Arc::new(AtomicBool::new(false)),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// 最近是否收到过对端的消息
    pub fn is_alive(&self) -> bool {
        self.monitor.check_connection()
    }

    /// 登记并发送一个请求，返回等待句柄
    ///
    /// 请求在发送前登记，保证应答不会先于登记到达。发送失败时撤销登记。
    pub fn send_request(
        &self,
        path: &str,
        args: impl IntoIterator<Item = Arg>,
        timeout: Duration,
    ) -> Result<ReplyHandle, DriverError> {
        if !self.is_running.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }

        let handle = self.pending.register_waiting(path, self.destination, timeout);
        let mut msg = Message::with_args(path, args).with_id(handle.id());
        if let Some(destination) = self.destination {
            msg = msg.to(destination);
        }
        trace!(%msg, id = %handle.id(), "request");

        let sent = self.config.retry.run(path, || {
            self.transport
                .send(&msg)
                .map_err(|e| DriverError::Request(RequestError::Transport(e)))
        });
        if let Err(e) = sent {
            self.pending.take(handle.id());
            return Err(e);
        }
        Ok(handle)
    }

    /// 发送请求并阻塞等待应答
    pub fn request(
        &self,
        path: &str,
        args: impl IntoIterator<Item = Arg>,
        timeout: Duration,
    ) -> Result<Reply, DriverError> {
        let handle = self.send_request(path, args, timeout)?;
        Ok(handle.wait(timeout)?)
    }

    /// 键名到请求路径：带 `machine:`/`drive:` 前缀的键按前缀路由，其余默认 `machine`
    fn key_path(key: &str) -> String {
        match key.split_once(':') {
            Some((ns @ ("machine" | "drive"), rest)) => key_to_path(ns, rest),
            _ => key_to_path("machine", key),
        }
    }
}

impl Driver for RemoteDriver {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    fn connect(&self) -> Result<(), DriverError> {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return Ok(());
        }

        self.is_running.store(true, Ordering::Release);
        self.monitor.register_feedback();

        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let monitor = self.monitor.clone();
        let is_running = self.is_running.clone();
        let poll = self.config.dispatch_poll;
        *dispatcher = Some(spawn(move || {
            dispatch_loop(transport, pending, monitor, is_running, poll);
        }));
        debug!(destination = ?self.destination, kind = %self.kind, "remote driver connected");
        Ok(())
    }

    fn exit(&self) {
        // Release: 分发线程看到 false 时也能看到之前的所有写入
        self.is_running.store(false, Ordering::Release);

        let join_timeout = self.config.dispatch_poll * 4 + Duration::from_millis(100);
        if let Some(handle) = self.dispatcher.lock().take()
            && let Err(_e) = handle.join_timeout(join_timeout)
        {
            error!("Dispatcher thread failed to shut down within {:?}", join_timeout);
        }

        let cancelled = self.pending.fail_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending requests on exit");
        }
    }

    fn get(&self, key: &str) -> Result<Value, DriverError> {
        let path = Self::key_path(key);
        let reply = self.request(&path, [], self.config.request_timeout)?;
        reply
            .args
            .first()
            .and_then(|arg| Value::try_from(arg).ok())
            .ok_or_else(|| DriverError::InvalidReply {
                path: reply.path.clone(),
                reason: "expected one value argument".to_string(),
            })
    }

    fn set(&self, key: &str, value: Value) -> Result<(), DriverError> {
        let path = Self::key_path(key);
        self.request(&path, [Arg::from(value)], self.config.request_timeout)?;
        Ok(())
    }

    fn attribute_map(&self) -> AttributeMap {
        drive_attributes()
    }

    fn ping(&self, timeout: Duration) -> Result<Duration, DriverError> {
        let reply = self.request("/ping", [], timeout)?;
        Ok(reply.latency)
    }

    fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for RemoteDriver {
    fn drop(&mut self) {
        self.exit();
    }
}

/// 分发线程主循环
///
/// 接收等待取 `poll` 与最近截止时间中较短者，保证超时能及时触发。
fn dispatch_loop(
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    monitor: Arc<ConnectionMonitor>,
    is_running: Arc<AtomicBool>,
    poll: Duration,
) {
    loop {
        // Acquire: 看到 false 时也能看到 exit() 之前的写入
        if !is_running.load(Ordering::Acquire) {
            trace!("Dispatcher: is_running flag is false, exiting");
            break;
        }

        let wait = match pending.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(poll),
            None => poll,
        }
        .max(Duration::from_millis(1));

        match transport.receive(wait) {
            Ok(msg) => {
                monitor.register_feedback();
                match pending.resolve(&msg) {
                    Resolution::Matched(id) => trace!(%id, path = msg.path(), "reply matched"),
                    Resolution::Stale => {
                        warn!(path = msg.path(), id = ?msg.id(), "dropping reply with no pending request")
                    },
                    Resolution::NotAReply => debug!(path = msg.path(), "ignoring unsolicited message"),
                }
            },
            Err(TransportError::Timeout) => {},
            Err(TransportError::Closed) => {
                warn!("Dispatcher: transport closed, exiting");
                break;
            },
            Err(e) => debug!(error = %e, "Dispatcher: receive error"),
        }

        let expired = pending.expire(Instant::now());
        if expired > 0 {
            debug!(expired, "requests timed out");
        }
    }

    trace!("Dispatcher: loop exited");
}
