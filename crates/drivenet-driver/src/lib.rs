//! # drivenet Driver Layer
//!
//! 驱动层：把一台电机驱动器（本地或远端）表示为按键读写的属性集合。
//!
//! ## 核心组件
//!
//! - [`Driver`]: 统一接口（connect / exit / get / set / attribute_map / ping）
//! - [`RemoteDriver`]: 通过传输层访问远端机器，带分发线程与请求关联
//! - [`VirtualDriver`]: 进程内模拟驱动器
//! - [`PendingTable`]: 请求/应答关联表（按 ID 或按路径匹配，超时恰好移除一次）
//! - [`RetryPolicy`]: 传输层故障的有界指数退避
//! - [`ConnectionMonitor`]: 最近一次收到对端消息的时间

pub mod attribute;
pub mod correlation;
mod error;
pub mod heartbeat;
pub mod remote;
pub mod retry;
pub mod value;
pub mod virtual_drive;

pub use attribute::{Access, Attribute, AttributeMap, drive_attributes};
pub use correlation::{Completion, Outcome, PendingTable, Reply, ReplyHandle, Resolution};
pub use error::{DriverError, RequestError};
pub use heartbeat::ConnectionMonitor;
pub use drivenet_transport::JoinTimeout;
pub use remote::{RemoteConfig, RemoteDriver};
pub use retry::RetryPolicy;
pub use value::{Value, ValueType};
pub use virtual_drive::VirtualDriver;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 驱动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// OSC 风格 UDP
    Osc,
    /// 串口帧
    Serial,
    /// 进程内模拟
    Virtual,
}

impl DriverKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverKind::Osc => "osc",
            DriverKind::Serial => "serial",
            DriverKind::Virtual => "virtual",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    /// 不区分大小写（`"Osc"`、`"osc"` 均可）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "osc" | "udp" => Ok(DriverKind::Osc),
            "serial" => Ok(DriverKind::Serial),
            "virtual" => Ok(DriverKind::Virtual),
            _ => Err(DriverError::UnknownKind(s.to_string())),
        }
    }
}

/// 驱动统一接口
///
/// 所有方法接收 `&self`，实现内部自行同步；驱动会被多个后台线程共享。
pub trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// 建立连接（启动后台线程等），重复调用无副作用
    fn connect(&self) -> Result<(), DriverError>;

    /// 断开连接，挂起请求以 `Closed` 结束；可重复调用
    fn exit(&self);

    /// 读取一个键
    ///
    /// # 错误
    /// - `DriverError::UnknownKey` / `DriverError::WriteOnly`: 键不可读
    fn get(&self, key: &str) -> Result<Value, DriverError>;

    /// 写入一个键
    ///
    /// # 错误
    /// - `DriverError::UnknownKey` / `DriverError::ReadOnly`: 键不可写
    /// - `DriverError::WrongType`: 值无法转换为键的类型
    fn set(&self, key: &str, value: Value) -> Result<(), DriverError>;

    /// 驱动报告的属性表
    fn attribute_map(&self) -> AttributeMap;

    /// 往返延迟；本地驱动没有链路，返回零
    fn ping(&self, timeout: Duration) -> Result<Duration, DriverError> {
        let _ = timeout;
        Ok(Duration::ZERO)
    }

    /// 尚未完成的请求数
    fn pending_requests(&self) -> usize {
        0
    }
}

impl<T: Driver + ?Sized> Driver for std::sync::Arc<T> {
    fn kind(&self) -> DriverKind {
        (**self).kind()
    }

    fn connect(&self) -> Result<(), DriverError> {
        (**self).connect()
    }

    fn exit(&self) {
        (**self).exit()
    }

    fn get(&self, key: &str) -> Result<Value, DriverError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), DriverError> {
        (**self).set(key, value)
    }

    fn attribute_map(&self) -> AttributeMap {
        (**self).attribute_map()
    }

    fn ping(&self, timeout: Duration) -> Result<Duration, DriverError> {
        (**self).ping(timeout)
    }

    fn pending_requests(&self) -> usize {
        (**self).pending_requests()
    }
}
