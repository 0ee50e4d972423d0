//! # drivenet Transport Layer
//!
//! 传输层抽象：把 [`Message`] 尽力投递到目的地址，不保证送达。
//!
//! - [`UdpTransport`]: OSC 风格 UDP 数据报，支持广播，携带请求 ID
//! - [`SerialTransport`]: 长度前缀串口帧，点对点，不携带请求 ID
//! - [`LoopbackNetwork`]: 进程内模拟网络（测试与单机调试）

use drivenet_protocol::{Message, ProtocolError};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub mod join;
pub mod loopback;
pub mod serial;
pub mod udp;

pub use join::JoinTimeout;
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use serial::SerialTransport;
pub use udp::UdpTransport;

// 重新导出协议层的消息类型
pub use drivenet_protocol::{Arg, RequestId};

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Protocol Error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Receive timeout")]
    Timeout,
    #[error("Transport closed")]
    Closed,
    #[error("Message has no destination address")]
    NoDestination,
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// 是否为接收超时（正常情况，不是故障）
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// 消息传输接口
///
/// 所有方法都接收 `&self`：发送可能来自任意线程，接收通常由唯一的分发线程调用。
pub trait Transport: Send + Sync {
    /// 发送消息到 `msg.receiver()`（点对点传输可忽略地址）
    fn send(&self, msg: &Message) -> Result<(), TransportError>;

    /// 接收一条消息，最多等待 `timeout`
    ///
    /// 超时返回 [`TransportError::Timeout`]。
    fn receive(&self, timeout: Duration) -> Result<Message, TransportError>;

    /// 广播消息（仅数据报传输支持）
    fn broadcast(&self, msg: &Message) -> Result<(), TransportError> {
        let _ = msg;
        Err(TransportError::Unsupported("broadcast"))
    }

    /// 本地地址（点对点传输返回 `None`）
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 传输是否携带显式请求 ID
    ///
    /// 不携带 ID 的传输只能按应答路径关联请求。
    fn carries_ids(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, msg: &Message) -> Result<(), TransportError> {
        (**self).send(msg)
    }

    fn receive(&self, timeout: Duration) -> Result<Message, TransportError> {
        (**self).receive(timeout)
    }

    fn broadcast(&self, msg: &Message) -> Result<(), TransportError> {
        (**self).broadcast(msg)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn carries_ids(&self) -> bool {
        (**self).carries_ids()
    }
}
