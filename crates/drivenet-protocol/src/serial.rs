//! 串口帧编解码
//!
//! 帧格式（小端）：
//!
//! ```text
//! ┌──────┬──────────────┬─────────────────────────────┬──────────┐
//! │ 0xA5 │ len: u16 LE  │ payload (len bytes)         │ xor: u8  │
//! └──────┴──────────────┴─────────────────────────────┴──────────┘
//! payload = path\0 | argc: u8 | (tag: u8 | data)*
//! ```
//!
//! 串口帧不携带请求 ID，应答通过路径匹配关联。

use crate::{Arg, Message, ProtocolError};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 帧起始字节
pub const FRAME_START: u8 = 0xA5;

/// 帧头长度（起始字节 + 长度字段）
const HEADER_LEN: usize = 3;

/// 单帧最大参数个数
pub const MAX_ARGS: usize = u8::MAX as usize;

/// 参数类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SerialTag {
    Int = 0x01,
    Long = 0x02,
    Float = 0x03,
    Str = 0x04,
    True = 0x05,
    False = 0x06,
    Nil = 0x07,
}

/// 编码消息为串口帧（忽略请求 ID 与地址）
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    if !msg.path().starts_with('/') {
        return Err(ProtocolError::InvalidPath(msg.path().to_string()));
    }
    if msg.args().len() > MAX_ARGS {
        return Err(ProtocolError::TooManyArgs(msg.args().len()));
    }

    let mut payload = Vec::with_capacity(32);
    payload.extend_from_slice(msg.path().as_bytes());
    payload.push(0);
    payload.push(msg.args().len() as u8);
    for arg in msg.args() {
        match arg {
            Arg::Int(v) => {
                payload.push(SerialTag::Int.into());
                payload.extend_from_slice(&v.to_le_bytes());
            },
            Arg::Long(v) => {
                payload.push(SerialTag::Long.into());
                payload.extend_from_slice(&v.to_le_bytes());
            },
            Arg::Float(v) => {
                payload.push(SerialTag::Float.into());
                payload.extend_from_slice(&v.to_le_bytes());
            },
            Arg::Str(s) => {
                payload.push(SerialTag::Str.into());
                payload.extend_from_slice(s.as_bytes());
                payload.push(0);
            },
            Arg::Bool(true) => payload.push(SerialTag::True.into()),
            Arg::Bool(false) => payload.push(SerialTag::False.into()),
            Arg::Nil => payload.push(SerialTag::Nil.into()),
        }
    }

    let len = u16::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(payload.len() + HEADER_LEN + 1);
    frame.push(FRAME_START);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.push(checksum(&payload));
    Ok(frame)
}

/// 解码单个帧负载（不含帧头与校验）
pub fn decode_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut offset = 0;
    let path = read_cstr(payload, &mut offset)?;
    if !path.starts_with('/') {
        return Err(ProtocolError::InvalidPath(path.to_string()));
    }
    let argc = *payload.get(offset).ok_or(ProtocolError::TooShort {
        expected: offset + 1,
        actual: payload.len(),
    })? as usize;
    offset += 1;

    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        let raw = *payload.get(offset).ok_or(ProtocolError::TooShort {
            expected: offset + 1,
            actual: payload.len(),
        })?;
        offset += 1;
        let tag = SerialTag::try_from(raw).map_err(|_| ProtocolError::UnknownTag(raw as char))?;
        let arg = match tag {
            SerialTag::Int => Arg::Int(i32::from_le_bytes(take::<4>(payload, &mut offset)?)),
            SerialTag::Long => Arg::Long(i64::from_le_bytes(take::<8>(payload, &mut offset)?)),
            SerialTag::Float => Arg::Float(f64::from_le_bytes(take::<8>(payload, &mut offset)?)),
            SerialTag::Str => Arg::Str(read_cstr(payload, &mut offset)?.to_string()),
            SerialTag::True => Arg::Bool(true),
            SerialTag::False => Arg::Bool(false),
            SerialTag::Nil => Arg::Nil,
        };
        args.push(arg);
    }

    Ok(Message::with_args(path, args))
}

/// 流式帧解码器
///
/// 串口是字节流，帧可能被拆分或粘连；解码器缓存未完成的数据，
/// 遇到损坏的帧时丢弃起始字节并重新同步。
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加接收到的字节
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 缓冲区中尚未解析的字节数
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 取出下一个完整帧
    ///
    /// - `None`: 数据不足
    /// - `Some(Err(_))`: 丢弃了一个损坏的帧（已重新同步，可继续调用）
    pub fn next_frame(&mut self) -> Option<Result<Message, ProtocolError>> {
        // 丢弃起始字节之前的噪声
        match self.buffer.iter().position(|&b| b == FRAME_START) {
            Some(0) => {},
            Some(start) => {
                self.buffer.drain(..start);
            },
            None => {
                self.buffer.clear();
                return None;
            },
        }

        if self.buffer.len() < HEADER_LEN {
            return None;
        }
        let len = u16::from_le_bytes([self.buffer[1], self.buffer[2]]) as usize;
        let total = HEADER_LEN + len + 1;
        if self.buffer.len() < total {
            return None;
        }

        let payload = &self.buffer[HEADER_LEN..HEADER_LEN + len];
        let expected = checksum(payload);
        let actual = self.buffer[total - 1];
        if expected != actual {
            // 只丢弃起始字节，后续数据中可能包含有效帧
            self.buffer.drain(..1);
            return Some(Err(ProtocolError::Checksum { expected, actual }));
        }

        let result = decode_payload(payload);
        self.buffer.drain(..total);
        Some(result)
    }
}

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc ^ b)
}

fn read_cstr<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a str, ProtocolError> {
    let start = *offset;
    let rest = data.get(start..).ok_or(ProtocolError::TooShort {
        expected: start + 1,
        actual: data.len(),
    })?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::InvalidString { offset: start })?;
    let s = std::str::from_utf8(&rest[..len])
        .map_err(|_| ProtocolError::InvalidString { offset: start })?;
    *offset = start + len + 1;
    Ok(s)
}

fn take<const N: usize>(data: &[u8], offset: &mut usize) -> Result<[u8; N], ProtocolError> {
    let end = *offset + N;
    let bytes = data.get(*offset..end).ok_or(ProtocolError::TooShort {
        expected: end,
        actual: data.len(),
    })?;
    *offset = end;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
