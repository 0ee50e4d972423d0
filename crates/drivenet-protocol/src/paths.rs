//! 键名与路径转换
//!
//! 命名空间键 `machine:command:enable` 在网络上表示为 `/machine/command/enable`。
//! 应答路径在请求路径后追加 `/reply`、`/ok` 或 `/error`。

/// 应答类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// 读请求的应答（携带值）
    Reply,
    /// 写请求确认
    Ok,
    /// 应用层错误（参数为错误描述）
    Error,
}

impl ReplyKind {
    pub const ALL: [ReplyKind; 3] = [ReplyKind::Reply, ReplyKind::Ok, ReplyKind::Error];

    pub fn suffix(self) -> &'static str {
        match self {
            ReplyKind::Reply => "/reply",
            ReplyKind::Ok => "/ok",
            ReplyKind::Error => "/error",
        }
    }
}

/// 拆分应答路径
///
/// 返回去掉后缀的请求路径与应答类型；不是应答路径时返回 `None`。
pub fn split_reply(path: &str) -> Option<(&str, ReplyKind)> {
    ReplyKind::ALL.into_iter().find_map(|kind| {
        path.strip_suffix(kind.suffix())
            .filter(|base| !base.is_empty())
            .map(|base| (base, kind))
    })
}

/// `("machine", "command:enable")` → `/machine/command/enable`
pub fn key_to_path(namespace: &str, key: &str) -> String {
    let mut path = String::with_capacity(namespace.len() + key.len() + 2);
    path.push('/');
    path.push_str(namespace);
    for part in key.split(':') {
        path.push('/');
        path.push_str(part);
    }
    path
}

/// `/machine/command/enable` → `("machine", "command:enable")`
pub fn path_to_key(path: &str) -> Option<(&str, String)> {
    let rest = path.strip_prefix('/')?;
    let (namespace, key) = rest.split_once('/')?;
    if namespace.is_empty() || key.is_empty() || key.split('/').any(str::is_empty) {
        return None;
    }
    Some((namespace, key.replace('/', ":")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_path_conversion() {
        assert_eq!(key_to_path("machine", "command:enable"), "/machine/command/enable");
        assert_eq!(key_to_path("drive", "velocity"), "/drive/velocity");
        assert_eq!(
            path_to_key("/machine/command/enable"),
            Some(("machine", "command:enable".to_string()))
        );
        assert_eq!(path_to_key("/machine"), None);
        assert_eq!(path_to_key("machine/velocity"), None);
        assert_eq!(path_to_key("/machine//velocity"), None);
    }

    #[test]
    fn test_split_reply() {
        assert_eq!(
            split_reply("/machine/velocity/reply"),
            Some(("/machine/velocity", ReplyKind::Reply))
        );
        assert_eq!(split_reply("/ping/ok"), Some(("/ping", ReplyKind::Ok)));
        assert_eq!(
            split_reply("/machine/x/error"),
            Some(("/machine/x", ReplyKind::Error))
        );
        assert_eq!(split_reply("/machine/velocity"), None);
        assert_eq!(split_reply("/reply"), None);
    }
}
