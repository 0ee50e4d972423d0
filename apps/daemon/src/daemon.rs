//! 守护进程核心逻辑
//!
//! 绑定 UDP 端口，启动响应线程，周期性广播发现，直到收到退出信号。

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use drivenet_driver::{Driver, DriverKind, RemoteDriver, VirtualDriver};
use drivenet_machine::factory::{remote_config, resolve_address};
use drivenet_machine::{Discovery, Machine, MachineSettings, ModeRequest, Responder};
use drivenet_transport::{SerialTransport, Transport, UdpTransport};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 守护进程配置（命令行）
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// 进入运行循环后切换到的工作模式
    pub initial_mode: Option<ModeRequest>,

    /// 发现广播周期，`None` 表示只在启动时广播一次
    pub discovery_interval: Option<Duration>,
}

/// 创建本机驱动
///
/// `virtual` 不需要地址；`osc` 为驱动器的 `ip[:port]`；`serial` 为设备文件。
pub fn local_driver(
    kind: DriverKind,
    address: Option<&str>,
    settings: &MachineSettings,
) -> Result<Arc<dyn Driver>> {
    let config = remote_config(settings);
    let driver: Arc<dyn Driver> = match kind {
        DriverKind::Virtual => Arc::new(VirtualDriver::new()),
        DriverKind::Osc => {
            let address = address.context("osc drive requires --drive-address")?;
            let destination = resolve_address(address, settings.port)?;
            let transport = UdpTransport::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
            Arc::new(RemoteDriver::new(kind, Arc::new(transport), Some(destination), config))
        },
        DriverKind::Serial => {
            let device = address.context("serial drive requires --drive-address")?;
            let transport = SerialTransport::open(device, settings.baud_rate)
                .with_context(|| format!("failed to open serial device {device}"))?;
            Arc::new(RemoteDriver::new(kind, Arc::new(transport), None, config))
        },
    };
    Ok(driver)
}

pub struct Daemon {
    machine: Arc<Machine>,
    responder: Responder,
    discovery: Discovery,
    config: DaemonConfig,
    stopped: bool,
}

impl Daemon {
    /// 绑定 `0.0.0.0:<port>`，广播地址取自机器配置
    pub fn new(machine: Arc<Machine>, config: DaemonConfig) -> Result<Self> {
        let settings = machine.settings();
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.port);
        let broadcast_ip: IpAddr = settings
            .broadcast
            .parse()
            .with_context(|| format!("invalid broadcast address '{}'", settings.broadcast))?;
        let transport = UdpTransport::bind(bind)
            .with_context(|| format!("failed to bind {bind}"))?
            .with_broadcast(SocketAddr::new(broadcast_ip, settings.port));
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let discovery = Discovery::new(transport.clone(), machine.alive().clone(), settings.port);
        let responder = Responder::spawn(machine.clone(), transport);
        info!(%bind, serial = machine.serialnumber(), "listening");

        Ok(Self {
            machine,
            responder,
            discovery,
            config,
            stopped: false,
        })
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// 运行直到 `shutdown` 收到消息或发送端全部断开
    pub fn run(&mut self, shutdown: Receiver<()>) -> Result<()> {
        if let Err(e) = self.discovery.discover() {
            warn!(error = %e, "initial discovery failed");
        }

        if let Some(request) = self.config.initial_mode.take() {
            // 发现应答需要一点时间才能解析按序列号配置的从机
            if matches!(request, ModeRequest::Master) {
                thread::sleep(self.machine.settings().request_timeout);
            }
            self.machine
                .set_operating_mode(request)
                .context("failed to enter initial operating mode")?;
        }

        let period = self.config.discovery_interval.unwrap_or(Duration::from_secs(3600));
        loop {
            match shutdown.recv_timeout(period) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {},
            }
            if self.config.discovery_interval.is_some()
                && let Err(e) = self.discovery.refresh(Instant::now())
            {
                warn!(error = %e, "discovery refresh failed");
            }
            if let Some(reason) = self.machine.fatal_reason() {
                warn!(%reason, "fatal slave error pending, write machine:command:clear_errors to resume");
            }
        }

        self.stop();
        Ok(())
    }

    /// 停止响应线程并关闭机器（幂等）
    pub fn stop(&mut self) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }
        self.responder.stop();
        self.machine.shutdown();
        info!("daemon stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_driver_requires_address() {
        let settings = MachineSettings::default();
        assert!(local_driver(DriverKind::Osc, None, &settings).is_err());
        assert!(local_driver(DriverKind::Serial, None, &settings).is_err());

        let driver = local_driver(DriverKind::Virtual, None, &settings).unwrap();
        assert_eq!(driver.kind(), DriverKind::Virtual);
    }
}
