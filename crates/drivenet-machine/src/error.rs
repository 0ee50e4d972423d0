//! 机器层错误类型定义

use drivenet_driver::{DriverError, ValueType};
use drivenet_transport::TransportError;
use thiserror::Error;

/// 值变换规则错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    /// 未知规则名
    #[error("Unknown transform rule: {0}")]
    UnknownRule(String),

    /// 规则缺少操作数（如 `multiply` 没有系数）
    #[error("Transform rule '{0}' requires an operand")]
    MissingOperand(String),

    /// 操作数无法解析
    #[error("Invalid operand '{operand}' for transform rule '{rule}'")]
    InvalidOperand { rule: String, operand: String },

    /// `divide 0`
    #[error("Transform rule 'divide' with zero divisor")]
    DivideByZero,

    /// 数值规则作用于非数值
    #[error("Transform rule '{rule}' cannot be applied to non-numeric value {value}")]
    NotNumeric { rule: &'static str, value: String },
}

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// 缺少必需项
    #[error("Missing config option [{section}] {key}")]
    Missing { section: String, key: String },

    /// 值格式错误
    #[error("Invalid value for [{section}] {key}: '{value}' ({reason})")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    /// 从机变换规则错误（加载时校验）
    #[error("Invalid transform for slave '{slave}' key '{key}': {source}")]
    Transform {
        slave: String,
        key: String,
        #[source]
        source: TransformError,
    },
}

/// 在线机器表持久化错误
#[derive(Error, Debug)]
pub enum DatastoreError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Datastore format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// 从机会话错误
///
/// `slave` 字段为从机描述（序列号与地址），便于日志定位。
#[derive(Error, Debug)]
pub enum SlaveMachineError {
    /// 驱动报告的错误
    #[error("Slave {slave}: {source}")]
    Driver {
        slave: String,
        #[source]
        source: DriverError,
    },

    /// 等待应答超时
    #[error("Slave {slave}: timeout waiting for {what}")]
    Timeout { slave: String, what: String },

    /// 会话已停止
    #[error("Slave {slave}: session stopped")]
    Stopped { slave: String },

    /// 发送队列已满
    #[error("Slave {slave}: bridge queue full")]
    QueueFull { slave: String },

    /// 连续错误超过阈值，已强制失能
    #[error("Slave {slave}: {errors} consecutive errors, slave disabled")]
    Fatal { slave: String, errors: u32 },
}

impl SlaveMachineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SlaveMachineError::Timeout { .. })
    }
}

/// 机器层错误类型
#[derive(Error, Debug)]
pub enum MachineError {
    /// 键没有命名空间或命名空间未知（应为 `machine:` 或 `drive:`）
    #[error("Invalid key '{0}': expected 'machine:<key>' or 'drive:<key>'")]
    InvalidKey(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Key is read-only: {0}")]
    ReadOnly(String),

    #[error("Key is write-only: {0}")]
    WriteOnly(String),

    #[error("Wrong type for {key}: expected {expected:?}, got {actual:?}")]
    WrongType {
        key: String,
        expected: ValueType,
        actual: ValueType,
    },

    /// 无效的工作模式名
    #[error("Invalid operating mode: {0}")]
    InvalidMode(String),

    /// 无效的从机子模式名
    #[error("Invalid submode: {0}")]
    InvalidSubmode(String),

    /// 进入主机模式时没有可解析的从机
    #[error("Cannot enter master mode: no resolvable slaves")]
    NoSlaves,

    /// 进入从机模式时没有主机地址
    #[error("Cannot enter slave mode: no master address")]
    MissingMaster,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Slave already registered: {0}")]
    SlaveExists(String),

    #[error("Slave not found: {0}")]
    SlaveNotFound(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("{0}")]
    Slave(#[from] SlaveMachineError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}
