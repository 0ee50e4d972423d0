//! 带超时的线程 join

use std::thread::{JoinHandle, spawn};
use std::time::Duration;

/// `JoinHandle` 的超时 join 扩展
///
/// 后台循环都以 `recv_timeout` 轮询运行标志，正常情况下会在一个轮询周期内退出；
/// 超时只用于防止某个循环卡在阻塞调用里时拖住整个关闭流程。
pub trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> std::thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Thread join timeout",
            ))),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Box::new(
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "Thread panicked during join"),
            )),
        }
    }
}
