//! 进程内模拟网络
//!
//! 行为与 UDP 一致：发往未绑定地址的消息静默丢弃，广播投递给除自己以外的所有节点。
//! 可以按节点关闭 ID 携带，模拟只能按路径匹配的协议；也可以断开链路模拟丢包。

use crate::{Transport, TransportError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use drivenet_protocol::Message;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// 每个节点的接收队列容量
const INBOX_CAPACITY: usize = 256;

#[derive(Default)]
struct NetworkInner {
    inboxes: HashMap<SocketAddr, Sender<Message>>,
    /// 断开的节点：发往或来自这些地址的消息全部丢弃
    down: HashSet<SocketAddr>,
}

/// 模拟网络（可克隆，克隆体共享同一网络）
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `addr` 上创建一个携带请求 ID 的节点
    pub fn bind(&self, addr: SocketAddr) -> LoopbackTransport {
        self.bind_with(addr, true)
    }

    /// 在 `addr` 上创建一个不携带请求 ID 的节点（发送时去掉 ID）
    pub fn bind_without_ids(&self, addr: SocketAddr) -> LoopbackTransport {
        self.bind_with(addr, false)
    }

    fn bind_with(&self, addr: SocketAddr, carries_ids: bool) -> LoopbackTransport {
        let (tx, rx) = crossbeam_channel::bounded(INBOX_CAPACITY);
        self.inner.write().inboxes.insert(addr, tx);
        LoopbackTransport {
            network: self.clone(),
            addr,
            rx,
            carries_ids,
        }
    }

    /// 断开/恢复某个节点的链路
    pub fn set_link_down(&self, addr: SocketAddr, down: bool) {
        let mut inner = self.inner.write();
        if down {
            inner.down.insert(addr);
        } else {
            inner.down.remove(&addr);
        }
    }

    /// 已绑定的节点数
    pub fn node_count(&self) -> usize {
        self.inner.read().inboxes.len()
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, msg: Message) {
        let inner = self.inner.read();
        if inner.down.contains(&from) || inner.down.contains(&to) {
            trace!(%from, %to, path = msg.path(), "loopback drop (link down)");
            return;
        }
        match inner.inboxes.get(&to) {
            // 队列满时丢弃，和 UDP 缓冲区溢出一样
            Some(inbox) => {
                let _ = inbox.try_send(msg.from_sender(from));
            },
            None => trace!(%to, path = msg.path(), "loopback drop (no such node)"),
        }
    }

    fn unbind(&self, addr: SocketAddr) {
        self.inner.write().inboxes.remove(&addr);
    }
}

/// 模拟网络上的一个节点
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    addr: SocketAddr,
    rx: Receiver<Message>,
    carries_ids: bool,
}

impl LoopbackTransport {
    fn outgoing(&self, msg: &Message) -> Message {
        if self.carries_ids {
            msg.clone()
        } else {
            msg.clone().without_id()
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let to = msg.receiver().ok_or(TransportError::NoDestination)?;
        self.network.deliver(self.addr, to, self.outgoing(msg));
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Message, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn broadcast(&self, msg: &Message) -> Result<(), TransportError> {
        let targets: Vec<SocketAddr> = self
            .network
            .inner
            .read()
            .inboxes
            .keys()
            .copied()
            .filter(|addr| *addr != self.addr)
            .collect();
        for to in targets {
            self.network.deliver(self.addr, to, self.outgoing(msg).to(to));
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    fn carries_ids(&self) -> bool {
        self.carries_ids
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.unbind(self.addr);
    }
}
