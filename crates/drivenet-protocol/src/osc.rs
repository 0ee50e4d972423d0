//! OSC 风格数据报编解码
//!
//! 布局（所有字段 4 字节对齐，数值为大端）：
//!
//! ```text
//! ┌──────────────┬─────────────────┬──────────────────────┐
//! │ path\0 (pad) │ ,[t]tags\0 (pad)│ [id: u64] args ...   │
//! └──────────────┴─────────────────┴──────────────────────┘
//! ```
//!
//! 类型标签：`i` i32、`h` i64、`f` f32（仅解码）、`d` f64、`s` 字符串、`T`/`F` 布尔、`N` 空。
//! 请求 ID 作为首个 `t` 参数携带，因此该传输"携带显式 ID"。

use crate::{Arg, Message, ProtocolError, RequestId};

const TAG_ID: u8 = b't';

/// 编码消息为数据报
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    if !msg.path().starts_with('/') {
        return Err(ProtocolError::InvalidPath(msg.path().to_string()));
    }

    let mut buf = Vec::with_capacity(64);
    write_padded_str(&mut buf, msg.path());

    let mut tags = String::with_capacity(msg.args().len() + 2);
    tags.push(',');
    if msg.id().is_some() {
        tags.push(TAG_ID as char);
    }
    for arg in msg.args() {
        tags.push(tag_of(arg));
    }
    write_padded_str(&mut buf, &tags);

    if let Some(id) = msg.id() {
        buf.extend_from_slice(&id.as_u64().to_be_bytes());
    }
    for arg in msg.args() {
        match arg {
            Arg::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Arg::Long(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Arg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Arg::Str(s) => write_padded_str(&mut buf, s),
            Arg::Bool(_) | Arg::Nil => {},
        }
    }

    Ok(buf)
}

/// 从数据报解码消息
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    let mut offset = 0;
    let path = read_padded_str(data, &mut offset)?;
    if !path.starts_with('/') {
        return Err(ProtocolError::InvalidPath(path.to_string()));
    }

    // 没有类型标签字符串的消息视为无参数（部分 OSC 实现允许省略）
    if offset >= data.len() {
        return Ok(Message::new(path));
    }

    let tags = read_padded_str(data, &mut offset)?;
    let tags = tags
        .strip_prefix(',')
        .ok_or_else(|| ProtocolError::InvalidString { offset })?;

    let mut id = None;
    let mut args = Vec::with_capacity(tags.len());
    for (index, tag) in tags.bytes().enumerate() {
        match tag {
            TAG_ID if index == 0 => {
                let raw = u64::from_be_bytes(take::<8>(data, &mut offset)?);
                id = RequestId::from_raw(raw);
            },
            b'i' => args.push(Arg::Int(i32::from_be_bytes(take::<4>(data, &mut offset)?))),
            b'h' => args.push(Arg::Long(i64::from_be_bytes(take::<8>(data, &mut offset)?))),
            b'f' => args.push(Arg::Float(f64::from(f32::from_be_bytes(take::<4>(
                data,
                &mut offset,
            )?)))),
            b'd' => args.push(Arg::Float(f64::from_be_bytes(take::<8>(data, &mut offset)?))),
            b's' => args.push(Arg::Str(read_padded_str(data, &mut offset)?.to_string())),
            b'T' => args.push(Arg::Bool(true)),
            b'F' => args.push(Arg::Bool(false)),
            b'N' => args.push(Arg::Nil),
            other => return Err(ProtocolError::UnknownTag(other as char)),
        }
    }

    let msg = Message::with_args(path, args);
    Ok(match id {
        Some(id) => msg.with_id(id),
        None => msg,
    })
}

fn tag_of(arg: &Arg) -> char {
    match arg {
        Arg::Int(_) => 'i',
        Arg::Long(_) => 'h',
        Arg::Float(_) => 'd',
        Arg::Str(_) => 's',
        Arg::Bool(true) => 'T',
        Arg::Bool(false) => 'F',
        Arg::Nil => 'N',
    }
}

fn write_padded_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn read_padded_str<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a str, ProtocolError> {
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

    // 跳过 NUL 与填充
    let consumed = (len + 4) & !3;
    *offset = (start + consumed).min(data.len());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout_is_aligned() {
        let msg = Message::new("/ping");
        let bytes = encode(&msg).unwrap();
        // "/ping\0\0\0" + ",\0\0\0"
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..5], b"/ping");
        assert_eq!(bytes[8], b',');
    }

    #[test]
    fn test_decode_mixed_arguments() {
        let id = RequestId::generate();
        let msg = Message::new("/machine/velocity_ref")
            .arg(20.0f64)
            .arg("slave")
            .arg(true)
            .arg(-3i32)
            .with_id(id);
        let decoded = decode(&encode(&msg).unwrap()).unwrap();

        assert_eq!(decoded.path(), "/machine/velocity_ref");
        assert_eq!(decoded.id(), Some(id));
        assert_eq!(
            decoded.args(),
            &[
                Arg::Float(20.0),
                Arg::Str("slave".into()),
                Arg::Bool(true),
                Arg::Int(-3)
            ]
        );
    }

    #[test]
    fn test_decode_single_precision_float() {
        // 外部 OSC 工具常发送 f32
        let mut data = Vec::new();
        write_padded_str(&mut data, "/machine/velocity");
        write_padded_str(&mut data, ",f");
        data.extend_from_slice(&1.5f32.to_be_bytes());

        let msg = decode(&data).unwrap();
        assert_eq!(msg.args(), &[Arg::Float(1.5)]);
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn test_decode_without_type_tags() {
        let mut data = Vec::new();
        write_padded_str(&mut data, "/identify");
        let msg = decode(&data).unwrap();
        assert_eq!(msg.path(), "/identify");
        assert!(msg.args().is_empty());
    }

    #[test]
    fn test_decode_truncated_argument() {
        let msg = Message::new("/x").arg(1.0f64);
        let bytes = encode(&msg).unwrap();
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { .. }));
    }

    #[test]
    fn test_reject_invalid_path_and_tag() {
        assert!(matches!(
            encode(&Message::new("noslash")),
            Err(ProtocolError::InvalidPath(_))
        ));

        let mut data = Vec::new();
        write_padded_str(&mut data, "/x");
        write_padded_str(&mut data, ",q");
        assert_eq!(decode(&data), Err(ProtocolError::UnknownTag('q')));
    }

    proptest::proptest! {
        /// 任意输入都只会返回错误，不会 panic
        #[test]
        fn prop_decode_arbitrary_bytes(data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..128)) {
            let _ = decode(&data);
        }
    }
}
