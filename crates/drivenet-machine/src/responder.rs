//! 请求响应线程
//!
//! 机器的网络入口：解码入站请求，路由到 [`Machine`] 的读写接口，回复
//! `/reply`、`/ok` 或 `/error`。同时回答 `/ping` 与 `/identify`，
//! 并把其它机器的 `/alive` 通告交给在线机器表。
//!
//! | 请求 | 应答 |
//! |------|------|
//! | `/ping` | `/ping/reply` |
//! | `/identify [port]` | `/alive (serial, address)` 发往请求方 |
//! | `/alive ...` | 无 |
//! | `/machine/<key>`（无参数） | `/machine/<key>/reply value` |
//! | `/machine/<key> value` | `/machine/<key>/ok` |
//! | 出错 | `<path>/error message` |

use crate::discovery::{ALIVE_PATH, IDENTIFY_PATH, alive_message};
use crate::error::MachineError;
use crate::machine::{DRIVE_NAMESPACE, MACHINE_NAMESPACE, Machine};
use drivenet_driver::{JoinTimeout, Value};
use drivenet_protocol::{Arg, Message, ReplyKind, path_to_key, split_reply};
use drivenet_transport::{Transport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

pub const PING_PATH: &str = "/ping";

/// 接收等待上限（决定 `stop()` 的延迟）
const RECEIVE_POLL: Duration = Duration::from_millis(50);

/// 处理一条入站消息，返回需要发送的应答
pub fn handle_message(machine: &Machine, msg: &Message) -> Option<Message> {
    let path = msg.path();
    if split_reply(path).is_some() {
        trace!(path, "ignoring stray reply");
        return None;
    }

    match path {
        PING_PATH => Some(msg.reply(ReplyKind::Reply, [])),
        IDENTIFY_PATH => identify_reply(machine, msg),
        ALIVE_PATH => {
            if machine.update_alive_machines(msg).is_none() {
                debug!(%msg, "malformed alive announcement");
            }
            None
        },
        _ => Some(handle_key_request(machine, msg)),
    }
}

fn identify_reply(machine: &Machine, msg: &Message) -> Option<Message> {
    let sender = msg.sender()?;
    let port = msg
        .args()
        .first()
        .and_then(Arg::as_i64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(sender.port());
    let to = SocketAddr::new(sender.ip(), port);
    Some(alive_message(machine.serialnumber(), &machine.address()).to(to))
}

fn handle_key_request(machine: &Machine, msg: &Message) -> Message {
    let result = match path_to_key(msg.path()) {
        Some((namespace @ (MACHINE_NAMESPACE | DRIVE_NAMESPACE), key)) => {
            let full_key = format!("{namespace}:{key}");
            if msg.args().is_empty() {
                machine
                    .get(&full_key)
                    .map(|value| msg.reply(ReplyKind::Reply, [Arg::from(value)]))
            } else {
                request_value(&key, msg.args())
                    .and_then(|value| machine.set(&full_key, value))
                    .map(|()| msg.reply(ReplyKind::Ok, []))
            }
        },
        _ => Err(MachineError::InvalidKey(msg.path().to_string())),
    };

    result.unwrap_or_else(|e| {
        debug!(path = msg.path(), error = %e, "request failed");
        msg.reply(ReplyKind::Error, [Arg::Str(e.to_string())])
    })
}

/// 写请求的值：工作模式的参数以空格拼接（`"slave" "10.0.0.1:6969"`），其它键取第一个参数
fn request_value(key: &str, args: &[Arg]) -> Result<Value, MachineError> {
    if key == "operating_mode" {
        let parts: Vec<String> = args
            .iter()
            .filter_map(|arg| Value::try_from(arg).ok())
            .map(|v| v.to_string())
            .collect();
        return Ok(Value::Str(parts.join(" ")));
    }
    args.first()
        .and_then(|arg| Value::try_from(arg).ok())
        .ok_or_else(|| MachineError::InvalidKey(format!("{key}: missing value")))
}

/// 响应线程
pub struct Responder {
    is_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Responder {
    pub fn spawn(machine: Arc<Machine>, transport: Arc<dyn Transport>) -> Self {
        let is_running = Arc::new(AtomicBool::new(true));
        let thread = {
            let is_running = is_running.clone();
            spawn(move || responder_loop(machine, transport, is_running))
        };
        Self {
            is_running,
            thread: Some(thread),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 停止线程（幂等）
    pub fn stop(&mut self) {
        // Release: 确保之前的写入对线程可见
        self.is_running.store(false, Ordering::Release);
        let timeout = RECEIVE_POLL + Duration::from_secs(2);
        if let Some(handle) = self.thread.take()
            && let Err(_e) = handle.join_timeout(timeout)
        {
            error!("Responder thread panicked or failed to shut down within {:?}", timeout);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn responder_loop(machine: Arc<Machine>, transport: Arc<dyn Transport>, is_running: Arc<AtomicBool>) {
    loop {
        if !is_running.load(Ordering::Acquire) {
            break;
        }
        let msg = match transport.receive(RECEIVE_POLL) {
            Ok(msg) => msg,
            Err(e) if e.is_timeout() => continue,
            Err(TransportError::Closed) => {
                warn!("transport closed, responder exiting");
                break;
            },
            Err(e) => {
                debug!(error = %e, "receive failed");
                continue;
            },
        };

        trace!(%msg, sender = ?msg.sender(), "request");
        if let Some(reply) = handle_message(&machine, &msg)
            && let Err(e) = transport.send(&reply)
        {
            debug!(path = reply.path(), error = %e, "failed to send reply");
        }
    }
    is_running.store(false, Ordering::Release);
    trace!("responder loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineSettings;
    use crate::factory::NetworkDriverFactory;
    use crate::mode::ModeKind;
    use drivenet_driver::VirtualDriver;

    fn machine() -> (Machine, Arc<VirtualDriver>) {
        let drive = Arc::new(VirtualDriver::new());
        let settings = MachineSettings {
            serialnumber: "DN-0002".into(),
            address: Some("10.0.0.2:6969".into()),
            ..MachineSettings::default()
        };
        let machine = Machine::new(settings, Vec::new(), drive.clone(), Arc::new(NetworkDriverFactory)).unwrap();
        (machine, drive)
    }

    fn from(msg: Message) -> Message {
        msg.from_sender("10.0.0.1:40000".parse().unwrap())
    }

    #[test]
    fn test_ping_and_identify() {
        let (machine, _) = machine();
        let reply = handle_message(&machine, &from(Message::new("/ping"))).unwrap();
        assert_eq!(reply.path(), "/ping/reply");
        assert_eq!(reply.receiver(), Some("10.0.0.1:40000".parse().unwrap()));

        let reply = handle_message(&machine, &from(Message::new("/identify").arg(6969))).unwrap();
        assert_eq!(reply.path(), "/alive");
        assert_eq!(reply.receiver(), Some("10.0.0.1:6969".parse().unwrap()));
        assert_eq!(
            reply.args(),
            &[Arg::Str("DN-0002".into()), Arg::Str("10.0.0.2:6969".into())]
        );
    }

    #[test]
    fn test_get_set_and_errors() {
        let (machine, drive) = machine();
        let reply = handle_message(&machine, &from(Message::new("/machine/velocity_ref").arg(2.5))).unwrap();
        assert_eq!(reply.path(), "/machine/velocity_ref/ok");
        assert_eq!(drive.peek("velocity_ref"), Some(Value::Float(2.5)));

        let reply = handle_message(&machine, &from(Message::new("/machine/velocity_ref"))).unwrap();
        assert_eq!(reply.path(), "/machine/velocity_ref/reply");
        assert_eq!(reply.args(), &[Arg::Float(2.5)]);

        let reply = handle_message(&machine, &from(Message::new("/machine/velocity").arg(1.0))).unwrap();
        assert_eq!(reply.path(), "/machine/velocity/error");
        assert!(reply.args()[0].as_str().unwrap().contains("read-only"));

        let reply = handle_message(&machine, &from(Message::new("/motor/velocity"))).unwrap();
        assert_eq!(reply.path(), "/motor/velocity/error");
    }

    #[test]
    fn test_operating_mode_args_are_joined() {
        let (machine, _) = machine();
        let msg = from(Message::new("/machine/operating_mode").arg("slave").arg("10.0.0.1:6969"));
        let reply = handle_message(&machine, &msg).unwrap();
        assert_eq!(reply.path(), "/machine/operating_mode/ok");
        assert_eq!(machine.mode_kind(), ModeKind::Slave);
        assert_eq!(machine.master().as_deref(), Some("10.0.0.1:6969"));
    }

    #[test]
    fn test_replies_and_alive_produce_no_answer() {
        let (machine, _) = machine();
        assert!(handle_message(&machine, &from(Message::new("/ping/reply"))).is_none());

        let alive = from(alive_message("DN-0009", "10.0.0.9:6969"));
        assert!(handle_message(&machine, &alive).is_none());
        assert!(machine.alive().find_by_serial("DN-0009").is_some());
    }
}
