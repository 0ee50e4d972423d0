//! UDP 数据报传输
//!
//! 使用 OSC 风格编码，每个数据报一条消息。

use crate::{Transport, TransportError};
use drivenet_protocol::{Message, osc};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::trace;

/// 最大数据报长度
const MAX_DATAGRAM: usize = 4096;

/// 阻塞接收的最小超时（`set_read_timeout` 不接受 0）
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// UDP 传输
pub struct UdpTransport {
    socket: UdpSocket,
    /// 广播目的地址（如 255.255.255.255:6969）
    broadcast_addr: Option<SocketAddr>,
    /// 当前生效的读超时（避免每次接收都调用系统调用）
    read_timeout: Mutex<Option<Duration>>,
}

impl UdpTransport {
    /// 绑定本地地址（如 "0.0.0.0:6969"）
    ///
    /// # 错误
    /// - `TransportError::Io`: 地址被占用或无权限
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            broadcast_addr: None,
            read_timeout: Mutex::new(None),
        })
    }

    /// 设置广播目的地址
    pub fn with_broadcast(mut self, addr: SocketAddr) -> Self {
        self.broadcast_addr = Some(addr);
        self
    }

    fn send_to(&self, msg: &Message, to: SocketAddr) -> Result<(), TransportError> {
        let bytes = osc::encode(msg)?;
        trace!(%to, path = msg.path(), "udp send");
        self.socket.send_to(&bytes, to)?;
        Ok(())
    }

    fn apply_read_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        let timeout = timeout.max(MIN_READ_TIMEOUT);
        let mut current = self.read_timeout.lock();
        if *current != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            *current = Some(timeout);
        }
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let to = msg.receiver().ok_or(TransportError::NoDestination)?;
        self.send_to(msg, to)
    }

    fn receive(&self, timeout: Duration) -> Result<Message, TransportError> {
        self.apply_read_timeout(timeout)?;

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(TransportError::Timeout);
            },
            Err(e) => return Err(e.into()),
        };

        let msg = osc::decode(&buf[..len])?;
        trace!(%from, path = msg.path(), "udp receive");
        Ok(msg.from_sender(from))
    }

    fn broadcast(&self, msg: &Message) -> Result<(), TransportError> {
        let to = self
            .broadcast_addr
            .ok_or(TransportError::Unsupported("no broadcast address configured"))?;
        self.send_to(msg, to)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn carries_ids(&self) -> bool {
        true
    }
}
