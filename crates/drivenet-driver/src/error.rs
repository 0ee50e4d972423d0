//! 驱动层错误类型定义

use crate::value::ValueType;
use drivenet_protocol::RequestId;
use drivenet_transport::TransportError;
use thiserror::Error;

/// 单次请求的错误（关联表产生）
#[derive(Error, Debug)]
pub enum RequestError {
    /// 截止时间内未收到匹配应答
    #[error("Request timeout: {path}")]
    Timeout { path: String },

    /// 对端返回 `/error` 应答
    #[error("Remote error on {path}: {message}")]
    Remote { path: String, message: String },

    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 驱动已退出，挂起请求被取消
    #[error("Request cancelled: driver closed")]
    Closed,

    /// 关联 ID 冲突（已有同 ID 的挂起请求）
    #[error("Duplicate request id {0}")]
    DuplicateId(RequestId),
}

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 未知键
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// 只读键不可写
    #[error("Key is read-only: {0}")]
    ReadOnly(String),

    /// 只写键不可读
    #[error("Key is write-only: {0}")]
    WriteOnly(String),

    /// 值类型不匹配
    #[error("Wrong type for {key}: expected {expected:?}, got {actual:?}")]
    WrongType {
        key: String,
        expected: ValueType,
        actual: ValueType,
    },

    /// 请求错误（超时、对端错误、传输故障）
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// 驱动未连接
    #[error("Driver not connected")]
    NotConnected,

    /// 应答格式错误
    #[error("Invalid reply on {path}: {reason}")]
    InvalidReply { path: String, reason: String },

    /// 驱动不支持该操作
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// 未知驱动类型名
    #[error("Unknown driver kind: {0}")]
    UnknownKind(String),
}

impl DriverError {
    /// 连接类故障（链路问题，而不是请求本身有问题）
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            DriverError::NotConnected
                | DriverError::Request(
                    RequestError::Timeout { .. } | RequestError::Transport(_) | RequestError::Closed
                )
        )
    }

    /// 可由驱动自身重试的故障
    ///
    /// 只有传输层发送失败会被重试；超时交给调用方计数，应用层错误直接上报。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::NotConnected | DriverError::Request(RequestError::Transport(_))
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Request(RequestError::Timeout { .. }))
    }
}
