//! RemoteDriver 端到端测试（进程内模拟网络）

use drivenet_driver::{
    Driver, DriverError, DriverKind, RemoteConfig, RemoteDriver, RequestError, RetryPolicy, Value,
};
use drivenet_protocol::{Arg, Message, ReplyKind};
use drivenet_transport::{LoopbackNetwork, LoopbackTransport, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

fn config() -> RemoteConfig {
    RemoteConfig {
        request_timeout: Duration::from_millis(300),
        retry: RetryPolicy::none(),
        dispatch_poll: Duration::from_millis(10),
        liveness_timeout: Duration::from_secs(1),
    }
}

/// 最小应答端：回答 ping 与少量键
struct FakeSlave {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Vec<String>>>,
}

impl FakeSlave {
    fn spawn(transport: LoopbackTransport) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            while !flag.load(Ordering::Acquire) {
                let Ok(msg) = transport.receive(Duration::from_millis(10)) else {
                    continue;
                };
                seen.push(msg.to_string());
                let reply = match (msg.path(), msg.args().is_empty()) {
                    ("/ping", _) => msg.reply(ReplyKind::Reply, []),
                    ("/machine/velocity", true) => msg.reply(ReplyKind::Reply, [Arg::Float(2.5)]),
                    ("/machine/velocity_ref", false) => msg.reply(ReplyKind::Ok, []),
                    _ => msg.reply(
                        ReplyKind::Error,
                        [Arg::from(format!("Unknown key: {}", msg.path()))],
                    ),
                };
                transport.send(&reply).unwrap();
            }
            seen
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(mut self) -> Vec<String> {
        self.stop.store(true, Ordering::Release);
        self.handle.take().unwrap().join().unwrap()
    }
}

fn connected_driver(net: &LoopbackNetwork, local: u16, remote: u16, with_ids: bool) -> RemoteDriver {
    let transport = if with_ids {
        net.bind(addr(local))
    } else {
        net.bind_without_ids(addr(local))
    };
    let driver = RemoteDriver::new(DriverKind::Osc, Arc::new(transport), Some(addr(remote)), config());
    driver.connect().unwrap();
    driver
}

#[test]
fn test_get_set_ping_with_ids() {
    let net = LoopbackNetwork::new();
    let slave = FakeSlave::spawn(net.bind(addr(2)));
    let driver = connected_driver(&net, 1, 2, true);

    assert_eq!(driver.get("velocity").unwrap(), Value::Float(2.5));
    driver.set("velocity_ref", Value::Float(20.0)).unwrap();
    assert!(driver.ping(Duration::from_millis(300)).unwrap() < Duration::from_millis(300));
    assert!(driver.is_alive());
    assert_eq!(driver.pending_requests(), 0);

    driver.exit();
    let seen = slave.stop();
    assert!(seen.iter().any(|m| m.starts_with("/machine/velocity_ref 20")));
}

#[test]
fn test_path_correlation_without_ids() {
    let net = LoopbackNetwork::new();
    let slave = FakeSlave::spawn(net.bind_without_ids(addr(2)));
    let driver = connected_driver(&net, 1, 2, false);

    assert_eq!(driver.get("velocity").unwrap(), Value::Float(2.5));
    driver.set("velocity_ref", Value::Float(1.0)).unwrap();
    assert_eq!(driver.pending_requests(), 0);

    driver.exit();
    slave.stop();
}

#[test]
fn test_out_of_order_replies_match_by_path() {
    let net = LoopbackNetwork::new();
    let slave = net.bind_without_ids(addr(2));
    let driver = connected_driver(&net, 1, 2, false);

    let ping = driver.send_request("/ping", [], Duration::from_secs(1)).unwrap();
    let velocity = driver
        .send_request("/machine/velocity", [], Duration::from_secs(1))
        .unwrap();

    let first = slave.receive(Duration::from_millis(200)).unwrap();
    let second = slave.receive(Duration::from_millis(200)).unwrap();
    // 先回答后发出的请求
    slave.send(&second.reply(ReplyKind::Reply, [Arg::Float(7.0)])).unwrap();
    slave.send(&first.reply(ReplyKind::Reply, [])).unwrap();

    let velocity = velocity.wait(Duration::from_secs(1)).unwrap();
    assert_eq!(velocity.path, "/machine/velocity/reply");
    assert_eq!(velocity.args, vec![Arg::Float(7.0)]);
    assert_eq!(ping.wait(Duration::from_secs(1)).unwrap().path, "/ping/reply");
    driver.exit();
}

#[test]
fn test_remote_error_is_not_connection_class() {
    let net = LoopbackNetwork::new();
    let slave = FakeSlave::spawn(net.bind(addr(2)));
    let driver = connected_driver(&net, 1, 2, true);

    let err = driver.get("bogus").unwrap_err();
    assert!(matches!(err, DriverError::Request(RequestError::Remote { .. })));
    assert!(!err.is_connection_class());

    driver.exit();
    slave.stop();
}

#[test]
fn test_ping_unreachable_times_out_and_table_is_empty() {
    let net = LoopbackNetwork::new();
    let driver = connected_driver(&net, 1, 99, true);

    let start = Instant::now();
    let err = driver.ping(Duration::from_millis(200)).unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(elapsed >= Duration::from_millis(200), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "returned too late: {elapsed:?}");
    assert_eq!(driver.pending_requests(), 0);
    driver.exit();
}

#[test]
fn test_late_reply_is_discarded() {
    let net = LoopbackNetwork::new();
    let slave = net.bind(addr(2));
    let driver = connected_driver(&net, 1, 2, true);

    let err = driver.ping(Duration::from_millis(50)).unwrap_err();
    assert!(err.is_timeout());

    let request = slave.receive(Duration::from_millis(100)).unwrap();
    slave.send(&request.reply(ReplyKind::Reply, [])).unwrap();
    thread::sleep(Duration::from_millis(50));

    // 迟到的应答既不会复活请求，也不会影响后续请求
    assert_eq!(driver.pending_requests(), 0);
    let next = driver.send_request("/ping", [], Duration::from_secs(1)).unwrap();
    let request = slave.receive(Duration::from_millis(100)).unwrap();
    slave.send(&request.reply(ReplyKind::Reply, [])).unwrap();
    assert!(next.wait(Duration::from_secs(1)).is_ok());
    driver.exit();
}

#[test]
fn test_exit_cancels_pending_and_is_idempotent() {
    let net = LoopbackNetwork::new();
    let _slave = net.bind(addr(2));
    let driver = connected_driver(&net, 1, 2, true);

    let handle = driver.send_request("/ping", [], Duration::from_secs(5)).unwrap();
    driver.exit();
    driver.exit();

    assert!(matches!(
        handle.wait(Duration::from_millis(100)),
        Err(RequestError::Closed)
    ));
    assert!(matches!(
        driver.get("velocity"),
        Err(DriverError::NotConnected)
    ));
}

#[test]
fn test_unsolicited_message_keeps_link_alive() {
    let net = LoopbackNetwork::new();
    let slave = net.bind(addr(2));
    let driver = connected_driver(&net, 1, 2, true);

    slave.send(&Message::new("/alive").arg("SN-1").to(addr(1))).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(driver.is_alive());
    driver.exit();
}
