//! # drivenet Protocol
//!
//! 机器间通信的消息模型与编解码（无网络依赖）
//!
//! ## 模块
//!
//! - `osc`: OSC 风格的 UDP 数据报编解码（携带显式请求 ID）
//! - `serial`: 长度前缀的二进制串口帧编解码（无请求 ID，按路径匹配）
//! - `paths`: 键名与消息路径之间的转换、应答后缀处理
//!
//! 两种编解码器共享同一个抽象：[`Message`]。

pub mod osc;
pub mod paths;
pub mod serial;

pub use paths::{ReplyKind, key_to_path, path_to_key, split_reply};

use smallvec::SmallVec;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// 数据长度不足
    #[error("Message too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// 字符串缺少 NUL 结束符或不是合法 UTF-8
    #[error("Invalid string at offset {offset}")]
    InvalidString { offset: usize },

    /// 地址路径不以 '/' 开头
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    /// 未知的类型标签
    #[error("Unknown type tag: {0:?}")]
    UnknownTag(char),

    /// 串口帧校验失败
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    /// 参数个数超过编码上限
    #[error("Too many arguments: {0}")]
    TooManyArgs(usize),

    /// 帧负载超过长度字段上限
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// 请求关联 ID
///
/// 由进程级随机源生成，0 保留为无效值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestId(u64);

impl RequestId {
    /// 生成一个新的随机 ID（非零）
    pub fn generate() -> Self {
        loop {
            let raw: u64 = rand::random();
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    /// 从原始值构造（0 返回 `None`）
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// 消息参数
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Arg {
    Int(i32),
    Long(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Nil,
}

impl Arg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }

    /// 数值参数统一转为 f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Arg::Int(v) => Some(f64::from(*v)),
            Arg::Long(v) => Some(*v as f64),
            Arg::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(i64::from(*v)),
            Arg::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v)
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Long(v)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

/// 参数缓冲区
///
/// 绝大多数请求只有 0-3 个参数，栈上预留 4 个位置避免堆分配。
pub type ArgBuffer = SmallVec<[Arg; 4]>;

/// 寻址消息（不可变）
///
/// 通过构建器方法（消费 `self`）生成，生成后只读。
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    path: String,
    args: ArgBuffer,
    id: Option<RequestId>,
    sender: Option<SocketAddr>,
    receiver: Option<SocketAddr>,
}

impl Message {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: ArgBuffer::new(),
            id: None,
            sender: None,
            receiver: None,
        }
    }

    pub fn with_args(path: impl Into<String>, args: impl IntoIterator<Item = Arg>) -> Self {
        let mut msg = Self::new(path);
        msg.args = args.into_iter().collect();
        msg
    }

    /// 追加一个参数
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }

    /// 设置目的地址
    pub fn to(mut self, receiver: SocketAddr) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// 设置来源地址（由传输层在接收时填写）
    pub fn from_sender(mut self, sender: SocketAddr) -> Self {
        self.sender = Some(sender);
        self
    }

    /// 去掉 ID（用于不支持 ID 的传输）
    pub fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn sender(&self) -> Option<SocketAddr> {
        self.sender
    }

    pub fn receiver(&self) -> Option<SocketAddr> {
        self.receiver
    }

    /// 构造应答消息
    ///
    /// 路径为 `<请求路径>/<后缀>`，沿用请求 ID，目的地址为请求的来源地址。
    pub fn reply(&self, kind: ReplyKind, args: impl IntoIterator<Item = Arg>) -> Message {
        let mut reply = Message::with_args(format!("{}{}", self.path, kind.suffix()), args);
        reply.id = self.id;
        reply.receiver = self.sender;
        reply
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        for arg in &self.args {
            match arg {
                Arg::Int(v) => write!(f, " {v}")?,
                Arg::Long(v) => write!(f, " {v}")?,
                Arg::Float(v) => write!(f, " {v}")?,
                Arg::Str(v) => write!(f, " {v:?}")?,
                Arg::Bool(v) => write!(f, " {v}")?,
                Arg::Nil => write!(f, " nil")?,
            }
        }
        if let Some(id) = self.id {
            write!(f, " #{id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_nonzero() {
        for _ in 0..1000 {
            assert_ne!(RequestId::generate().as_u64(), 0);
        }
        assert!(RequestId::from_raw(0).is_none());
        assert_eq!(RequestId::from_raw(7).map(RequestId::as_u64), Some(7));
    }

    #[test]
    fn test_reply_targets_sender_and_keeps_id() {
        let sender: SocketAddr = "10.0.0.2:6969".parse().unwrap();
        let id = RequestId::generate();
        let request = Message::new("/machine/velocity").with_id(id).from_sender(sender);

        let reply = request.reply(ReplyKind::Reply, [Arg::Float(1.5)]);
        assert_eq!(reply.path(), "/machine/velocity/reply");
        assert_eq!(reply.id(), Some(id));
        assert_eq!(reply.receiver(), Some(sender));
        assert_eq!(reply.args(), &[Arg::Float(1.5)]);
    }

    #[test]
    fn test_arg_numeric_views() {
        assert_eq!(Arg::Int(3).as_f64(), Some(3.0));
        assert_eq!(Arg::Long(-4).as_i64(), Some(-4));
        assert_eq!(Arg::Float(2.5).as_i64(), None);
        assert_eq!(Arg::from("x").as_str(), Some("x"));
    }

    #[test]
    fn test_display() {
        let msg = Message::new("/ping").arg(1i32).arg("a");
        assert_eq!(msg.to_string(), "/ping 1 \"a\"");
    }
}
