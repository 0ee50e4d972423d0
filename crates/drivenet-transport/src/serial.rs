//! 串口传输
//!
//! 点对点字节流，使用长度前缀帧，端口由 `serialport` 打开。接收由后台线程完成：
//! 读取字节 → [`FrameDecoder`] → 通道，`receive()` 只在通道上带超时等待。

use crate::join::JoinTimeout;
use crate::{Transport, TransportError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use drivenet_protocol::serial::{FrameDecoder, encode_frame};
use drivenet_protocol::Message;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, spawn};
use std::time::Duration;
use tracing::{debug, error, warn};

/// 接收通道容量（帧）
const RX_CHANNEL_CAPACITY: usize = 64;

/// 串口读超时，决定读线程检查运行标志的周期
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// 串口传输
pub struct SerialTransport {
    writer: Mutex<Box<dyn Write + Send>>,
    rx: Receiver<Message>,
    is_running: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// 打开串口（如 `/dev/ttyACM0`），8N1，读超时 100ms
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader = port.try_clone()?;
        debug!(path, baud_rate, "serial port opened");
        Ok(Self::new(reader, port))
    }

    /// 从任意读写半部构造（测试时可传入内存流）
    ///
    /// `reader` 需要周期性返回（数据、`TimedOut` 或 EOF），否则 Drop 时读线程无法退出。
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(RX_CHANNEL_CAPACITY);
        let is_running = Arc::new(AtomicBool::new(true));
        let reader_thread = {
            let is_running = is_running.clone();
            spawn(move || reader_loop(reader, tx, is_running))
        };

        Self {
            writer: Mutex::new(Box::new(writer)),
            rx,
            is_running,
            reader_thread: Some(reader_thread),
        }
    }
}

fn reader_loop(mut reader: impl Read, tx: Sender<Message>, is_running: Arc<AtomicBool>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];

    while is_running.load(Ordering::Acquire) {
        let len = match reader.read(&mut buf) {
            Ok(0) => {
                debug!("serial link closed (EOF)");
                break;
            },
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("serial read error: {}", e);
                break;
            },
        };

        decoder.push(&buf[..len]);
        while let Some(frame) = decoder.next_frame() {
            match frame {
                Ok(msg) => {
                    if tx.send(msg).is_err() {
                        return;
                    }
                },
                Err(e) => warn!("dropping corrupt serial frame: {}", e),
            }
        }
    }
}

impl Transport for SerialTransport {
    fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let frame = encode_frame(msg)?;
        let mut writer = self.writer.lock();
        writer.write_all(&frame)?;
        writer.flush()?;
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Message, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn carries_ids(&self) -> bool {
        false
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Release);
        let timeout = READ_TIMEOUT + Duration::from_secs(1);
        if let Some(handle) = self.reader_thread.take()
            && let Err(_e) = handle.join_timeout(timeout)
        {
            error!("Serial reader thread panicked or failed to shut down within {:?}", timeout);
        }
    }
}
