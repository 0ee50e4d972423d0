//! 请求/应答关联
//!
//! 每个发出的请求在 [`PendingTable`] 中登记一条挂起记录，记录随后**恰好被移除一次**：
//! 由匹配的应答（[`PendingTable::resolve`]）、截止时间到期（[`PendingTable::expire`]）、
//! 或等待方超时（[`ReplyHandle::wait`]）中先发生的一方移除。移除与完成在同一把锁下
//! 决定归属，完成回调在锁外执行。
//!
//! # 匹配规则
//!
//! - 应答携带 ID：按 ID 精确匹配
//! - 应答不携带 ID：去掉 `/reply`、`/ok`、`/error` 后缀，在同一目的地址的挂起请求中
//!   选择路径为其最长前缀的请求，长度相同时选最早发出的
//!
//! 到期后才到达的应答返回 [`Resolution::Stale`]，由调用方记录并丢弃。

use crate::error::RequestError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use drivenet_protocol::{Arg, Message, ReplyKind, RequestId, split_reply};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 请求结果
pub type Outcome = Result<Reply, RequestError>;

/// 成功的应答
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// 应答路径（含后缀）
    pub path: String,
    pub kind: ReplyKind,
    pub args: Vec<Arg>,
    /// 从登记到收到应答的往返时间
    pub latency: Duration,
}

/// 完成方式
pub enum Completion {
    /// 阻塞等待方（容量 1 的通道）
    Waiter(Sender<Outcome>),
    /// 非阻塞回调（在分发线程或超时线程上执行，必须尽快返回）
    Callback(Box<dyn FnOnce(Outcome) + Send>),
}

impl Completion {
    fn complete(self, outcome: Outcome) {
        match self {
            // 等待方可能已经放弃，发送失败无需处理
            Completion::Waiter(tx) => {
                let _ = tx.send(outcome);
            },
            Completion::Callback(callback) => callback(outcome),
        }
    }
}

/// 应答匹配结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// 匹配并完成了一条挂起请求
    Matched(RequestId),
    /// 是应答，但没有对应的挂起请求（已超时或重复应答）
    Stale,
    /// 不是应答消息
    NotAReply,
}

struct Pending {
    path: String,
    destination: Option<SocketAddr>,
    sent_at: Instant,
    deadline: Instant,
    completion: Completion,
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<RequestId, Pending>,
    /// 每个目的地址的登记顺序（路径匹配时选最早的）
    order: HashMap<Option<SocketAddr>, VecDeque<RequestId>>,
}

impl TableInner {
    fn remove(&mut self, id: RequestId) -> Option<Pending> {
        let pending = self.entries.remove(&id)?;
        if let Some(queue) = self.order.get_mut(&pending.destination) {
            queue.retain(|queued| *queued != id);
            if queue.is_empty() {
                self.order.remove(&pending.destination);
            }
        }
        Some(pending)
    }

    fn match_path(&self, destination: Option<SocketAddr>, base: &str) -> Option<RequestId> {
        let queue = self.order.get(&destination)?;
        let mut best: Option<(usize, RequestId)> = None;
        for id in queue {
            let Some(pending) = self.entries.get(id) else {
                continue;
            };
            if path_covers(&pending.path, base)
                && best.is_none_or(|(len, _)| pending.path.len() > len)
            {
                best = Some((pending.path.len(), *id));
            }
        }
        best.map(|(_, id)| id)
    }
}

/// `request` 是否为 `reply_base` 的路径前缀（按 '/' 边界）
fn path_covers(request: &str, reply_base: &str) -> bool {
    reply_base == request
        || (reply_base.starts_with(request) && reply_base.as_bytes().get(request.len()) == Some(&b'/'))
}

/// 挂起请求表
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<TableInner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一条挂起请求
    ///
    /// # 错误
    /// - `RequestError::DuplicateId`: 已有同 ID 的挂起请求
    pub fn register(
        &self,
        id: RequestId,
        path: impl Into<String>,
        destination: Option<SocketAddr>,
        timeout: Duration,
        completion: Completion,
    ) -> Result<(), RequestError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return Err(RequestError::DuplicateId(id));
        }
        let now = Instant::now();
        inner.entries.insert(
            id,
            Pending {
                path: path.into(),
                destination,
                sent_at: now,
                deadline: now + timeout,
                completion,
            },
        );
        inner.order.entry(destination).or_default().push_back(id);
        Ok(())
    }

    /// 在锁内选取一个未占用的随机 ID 并登记
    fn insert_fresh(
        &self,
        path: String,
        destination: Option<SocketAddr>,
        timeout: Duration,
        completion: Completion,
    ) -> RequestId {
        let mut inner = self.inner.lock();
        let id = loop {
            let candidate = RequestId::generate();
            if !inner.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let now = Instant::now();
        inner.entries.insert(
            id,
            Pending {
                path,
                destination,
                sent_at: now,
                deadline: now + timeout,
                completion,
            },
        );
        inner.order.entry(destination).or_default().push_back(id);
        id
    }

    /// 登记一条由调用方阻塞等待的请求
    pub fn register_waiting(
        self: &Arc<Self>,
        path: impl Into<String>,
        destination: Option<SocketAddr>,
        timeout: Duration,
    ) -> ReplyHandle {
        let path = path.into();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = self.insert_fresh(path.clone(), destination, timeout, Completion::Waiter(tx));
        ReplyHandle {
            id,
            path,
            rx,
            table: self.clone(),
        }
    }

    /// 登记一条回调式请求，返回分配的 ID
    pub fn register_callback(
        &self,
        path: impl Into<String>,
        destination: Option<SocketAddr>,
        timeout: Duration,
        callback: impl FnOnce(Outcome) + Send + 'static,
    ) -> RequestId {
        self.insert_fresh(
            path.into(),
            destination,
            timeout,
            Completion::Callback(Box::new(callback)),
        )
    }

    /// 用入站消息匹配挂起请求
    pub fn resolve(&self, msg: &Message) -> Resolution {
        let Some((base, kind)) = split_reply(msg.path()) else {
            return Resolution::NotAReply;
        };

        let removed = {
            let mut inner = self.inner.lock();
            let id = match msg.id() {
                Some(id) if inner.entries.contains_key(&id) => Some(id),
                Some(_) => None,
                None => inner.match_path(msg.sender(), base),
            };
            id.and_then(|id| inner.remove(id).map(|pending| (id, pending)))
        };

        let Some((id, pending)) = removed else {
            return Resolution::Stale;
        };

        let outcome = match kind {
            ReplyKind::Error => Err(RequestError::Remote {
                path: pending.path.clone(),
                message: msg
                    .args()
                    .first()
                    .and_then(Arg::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            ReplyKind::Reply | ReplyKind::Ok => Ok(Reply {
                path: msg.path().to_string(),
                kind,
                args: msg.args().to_vec(),
                latency: pending.sent_at.elapsed(),
            }),
        };
        pending.completion.complete(outcome);
        Resolution::Matched(id)
    }

    /// 移除并以超时完成所有截止时间不晚于 `now` 的请求，返回数量
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<Pending> = {
            let mut inner = self.inner.lock();
            let ids: Vec<RequestId> = inner
                .entries
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| inner.remove(id)).collect()
        };

        let count = expired.len();
        for pending in expired {
            let path = pending.path.clone();
            pending.completion.complete(Err(RequestError::Timeout { path }));
        }
        count
    }

    /// 移除一条请求但不完成它（等待方自行处理超时）
    ///
    /// 返回 `true` 表示由本次调用移除。
    pub fn take(&self, id: RequestId) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    /// 以 `Closed` 完成所有挂起请求（驱动退出时调用）
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut inner = self.inner.lock();
            inner.order.clear();
            inner.entries.drain().map(|(_, pending)| pending).collect()
        };
        let count = drained.len();
        for pending in drained {
            pending.completion.complete(Err(RequestError::Closed));
        }
        count
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 最近的截止时间（分发线程据此决定轮询间隔）
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().entries.values().map(|p| p.deadline).min()
    }
}

/// 阻塞等待句柄
pub struct ReplyHandle {
    id: RequestId,
    path: String,
    rx: Receiver<Outcome>,
    table: Arc<PendingTable>,
}

impl ReplyHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// 等待应答，最多 `timeout`
    ///
    /// 超时后移除挂起记录；如果记录已被其他方移除（应答与超时竞争），
    /// 则结果必然即将送达，继续接收即可，不会永久阻塞。
    pub fn wait(self, timeout: Duration) -> Outcome {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.table.take(self.id) {
                    Err(RequestError::Timeout { path: self.path })
                } else {
                    self.rx.recv().unwrap_or(Err(RequestError::Closed))
                }
            },
            Err(RecvTimeoutError::Disconnected) => Err(RequestError::Closed),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slave() -> Option<SocketAddr> {
        Some(SocketAddr::from(([192, 168, 1, 20], 6969)))
    }

    fn reply_from(path: &str, sender: Option<SocketAddr>) -> Message {
        let msg = Message::new(path);
        match sender {
            Some(addr) => msg.from_sender(addr),
            None => msg,
        }
    }

    #[test]
    fn test_resolve_by_id() {
        let table = Arc::new(PendingTable::new());
        let handle = table.register_waiting("/machine/velocity", slave(), Duration::from_secs(1));
        let reply = Message::new("/machine/velocity/reply")
            .arg(1.5)
            .with_id(handle.id())
            .from_sender(SocketAddr::from(([10, 0, 0, 9], 1)));

        // ID 匹配不看来源地址
        assert_eq!(table.resolve(&reply), Resolution::Matched(handle.id()));
        let reply = handle.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(reply.kind, ReplyKind::Reply);
        assert_eq!(reply.args, vec![Arg::Float(1.5)]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolve_by_longest_path_prefix() {
        let table = PendingTable::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let tx_a = tx.clone();
        let short = table.register_callback("/machine", slave(), Duration::from_secs(1), move |o| {
            let _ = tx_a.send(("short", o.is_ok()));
        });
        let long = table.register_callback(
            "/machine/command/enable",
            slave(),
            Duration::from_secs(1),
            move |o| {
                let _ = tx.send(("long", o.is_ok()));
            },
        );

        let matched = table.resolve(&reply_from("/machine/command/enable/ok", slave()));
        assert_eq!(matched, Resolution::Matched(long));
        assert_eq!(rx.try_recv().unwrap(), ("long", true));
        assert!(table.contains(short));
    }

    #[test]
    fn test_resolve_by_path_oldest_first_and_boundary() {
        let table = PendingTable::new();
        let first = table.register_callback("/ping", slave(), Duration::from_secs(1), |_| {});
        let second = table.register_callback("/ping", slave(), Duration::from_secs(1), |_| {});

        // 不在 '/' 边界上的前缀不算匹配
        assert_eq!(
            table.resolve(&reply_from("/pingpong/reply", slave())),
            Resolution::Stale
        );
        assert_eq!(
            table.resolve(&reply_from("/ping/reply", slave())),
            Resolution::Matched(first)
        );
        assert_eq!(
            table.resolve(&reply_from("/ping/reply", slave())),
            Resolution::Matched(second)
        );
    }

    #[test]
    fn test_resolve_path_requires_same_destination() {
        let table = PendingTable::new();
        table.register_callback("/ping", slave(), Duration::from_secs(1), |_| {});
        let other = Some(SocketAddr::from(([192, 168, 1, 21], 6969)));
        assert_eq!(table.resolve(&reply_from("/ping/reply", other)), Resolution::Stale);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_error_reply_completes_with_remote_error() {
        let table = Arc::new(PendingTable::new());
        let handle = table.register_waiting("/machine/bogus", slave(), Duration::from_secs(1));
        let reply = Message::new("/machine/bogus/error")
            .arg("Unknown key: bogus")
            .with_id(handle.id());
        table.resolve(&reply);

        match handle.wait(Duration::from_millis(100)) {
            Err(RequestError::Remote { path, message }) => {
                assert_eq!(path, "/machine/bogus");
                assert_eq!(message, "Unknown key: bogus");
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_non_reply_is_ignored() {
        let table = PendingTable::new();
        assert_eq!(table.resolve(&Message::new("/machine/velocity")), Resolution::NotAReply);
    }

    #[test]
    fn test_wait_timeout_removes_entry_and_late_reply_is_stale() {
        let table = Arc::new(PendingTable::new());
        let handle = table.register_waiting("/ping", slave(), Duration::from_millis(20));
        let id = handle.id();

        let outcome = handle.wait(Duration::from_millis(20));
        assert!(matches!(outcome, Err(RequestError::Timeout { .. })));
        assert!(table.is_empty());

        let late = Message::new("/ping/reply").with_id(id);
        assert_eq!(table.resolve(&late), Resolution::Stale);
    }

    #[test]
    fn test_expire_completes_with_timeout() {
        let table = PendingTable::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        table.register_callback("/ping", slave(), Duration::ZERO, move |o| {
            let _ = tx.send(o);
        });
        table.register_callback("/identify", slave(), Duration::from_secs(60), |_| {});

        assert_eq!(table.expire(Instant::now()), 1);
        assert!(matches!(rx.try_recv().unwrap(), Err(RequestError::Timeout { .. })));
        assert_eq!(table.len(), 1);
        assert!(table.next_deadline().is_some());
    }

    #[test]
    fn test_register_duplicate_id_rejected() {
        let table = PendingTable::new();
        let id = RequestId::generate();
        let (tx, _rx) = crossbeam_channel::bounded(1);
        table
            .register(id, "/ping", None, Duration::from_secs(1), Completion::Waiter(tx.clone()))
            .unwrap();
        let err = table
            .register(id, "/ping", None, Duration::from_secs(1), Completion::Waiter(tx))
            .unwrap_err();
        assert!(matches!(err, RequestError::DuplicateId(dup) if dup == id));
    }

    #[test]
    fn test_fail_all_completes_with_closed() {
        let table = Arc::new(PendingTable::new());
        let handle = table.register_waiting("/ping", slave(), Duration::from_secs(5));
        assert_eq!(table.fail_all(), 1);
        assert!(matches!(
            handle.wait(Duration::from_millis(100)),
            Err(RequestError::Closed)
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register { long_timeout: bool },
        Reply(usize),
        Expire,
        Take(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<bool>().prop_map(|long_timeout| Op::Register { long_timeout }),
            any::<usize>().prop_map(Op::Reply),
            Just(Op::Expire),
            any::<usize>().prop_map(Op::Take),
        ]
    }

    proptest! {
        /// 任意操作交错下，每个登记的请求恰好被完成或取走一次
        #[test]
        fn prop_each_request_removed_exactly_once(ops in prop::collection::vec(op_strategy(), 1..64)) {
            let table = PendingTable::new();
            let completions: Arc<Mutex<HashMap<RequestId, u32>>> = Arc::default();
            let mut ids = Vec::new();
            let mut taken: HashMap<RequestId, u32> = HashMap::new();

            for op in ops {
                match op {
                    Op::Register { long_timeout } => {
                        let timeout = if long_timeout { Duration::from_secs(3600) } else { Duration::ZERO };
                        let id = RequestId::generate();
                        let counter = completions.clone();
                        let completion = Completion::Callback(Box::new(move |_| {
                            *counter.lock().entry(id).or_default() += 1;
                        }));
                        prop_assert!(table.register(id, "/ping", slave(), timeout, completion).is_ok());
                        ids.push(id);
                    },
                    Op::Reply(i) if !ids.is_empty() => {
                        let id = ids[i % ids.len()];
                        table.resolve(&Message::new("/ping/reply").with_id(id));
                    },
                    Op::Expire => {
                        table.expire(Instant::now());
                    },
                    Op::Take(i) if !ids.is_empty() => {
                        let id = ids[i % ids.len()];
                        if table.take(id) {
                            *taken.entry(id).or_default() += 1;
                        }
                    },
                    _ => {},
                }
            }
            table.fail_all();

            let completions = completions.lock();
            for id in &ids {
                let completed = completions.get(id).copied().unwrap_or(0);
                let removed = taken.get(id).copied().unwrap_or(0);
                prop_assert_eq!(completed + removed, 1, "request {} removed {} times", id, completed + removed);
            }
            prop_assert!(table.is_empty());
        }
    }
}
