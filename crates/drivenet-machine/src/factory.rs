//! 从机驱动工厂
//!
//! 每个从机会话独占一个驱动实例与传输端点，应答直接回到该端点。

use crate::config::MachineSettings;
use crate::error::MachineError;
use crate::slave::Slave;
use drivenet_driver::{Driver, DriverKind, RemoteConfig, RemoteDriver, RetryPolicy, VirtualDriver};
use drivenet_transport::{LoopbackNetwork, SerialTransport, UdpTransport};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tracing::debug;

pub trait DriverFactory: Send + Sync {
    /// 为从机创建驱动（尚未连接）
    fn create(&self, slave: &Slave, settings: &MachineSettings) -> Result<Arc<dyn Driver>, MachineError>;
}

/// 从机器参数推导远端驱动配置
pub fn remote_config(settings: &MachineSettings) -> RemoteConfig {
    RemoteConfig {
        request_timeout: settings.request_timeout,
        retry: RetryPolicy::default(),
        dispatch_poll: Duration::from_millis(50).min(settings.request_timeout),
        liveness_timeout: settings.slave_timeout,
    }
}

/// 解析 `host[:port]`，缺省端口为 `default_port`
pub fn resolve_address(address: &str, default_port: u16) -> Result<SocketAddr, MachineError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(MachineError::InvalidAddress(address.to_string()));
    }
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let with_port = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{default_port}")
    };
    with_port
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| MachineError::InvalidAddress(address.to_string()))
}

fn require_address(slave: &Slave) -> Result<&str, MachineError> {
    slave
        .address()
        .ok_or_else(|| MachineError::InvalidAddress(format!("slave {slave} has no address")))
}

/// 真实网络：OSC 走 UDP，串口走设备文件
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkDriverFactory;

impl DriverFactory for NetworkDriverFactory {
    fn create(&self, slave: &Slave, settings: &MachineSettings) -> Result<Arc<dyn Driver>, MachineError> {
        let config = remote_config(settings);
        match slave.kind() {
            DriverKind::Osc => {
                let destination = resolve_address(require_address(slave)?, settings.port)?;
                let transport = UdpTransport::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
                debug!(%slave, %destination, "udp slave driver created");
                Ok(Arc::new(RemoteDriver::new(
                    DriverKind::Osc,
                    Arc::new(transport),
                    Some(destination),
                    config,
                )))
            },
            DriverKind::Serial => {
                let device = require_address(slave)?;
                let transport = SerialTransport::open(device, settings.baud_rate)?;
                debug!(%slave, device, "serial slave driver created");
                Ok(Arc::new(RemoteDriver::new(
                    DriverKind::Serial,
                    Arc::new(transport),
                    None,
                    config,
                )))
            },
            DriverKind::Virtual => Ok(Arc::new(VirtualDriver::new())),
        }
    }
}

/// 内存网络：每个会话在 `127.0.0.1` 上占用一个递增端口
pub struct LoopbackDriverFactory {
    network: LoopbackNetwork,
    next_port: AtomicU16,
}

impl LoopbackDriverFactory {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self {
            network,
            next_port: AtomicU16::new(40000),
        }
    }
}

impl DriverFactory for LoopbackDriverFactory {
    fn create(&self, slave: &Slave, settings: &MachineSettings) -> Result<Arc<dyn Driver>, MachineError> {
        if slave.kind() == DriverKind::Virtual {
            return Ok(Arc::new(VirtualDriver::new()));
        }
        let destination = resolve_address(require_address(slave)?, settings.port)?;
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Ok(Arc::new(RemoteDriver::new(
            slave.kind(),
            Arc::new(self.network.bind(local)),
            Some(destination),
            remote_config(settings),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submode::Submode;

    #[test]
    fn test_resolve_address() {
        assert_eq!(
            resolve_address("10.0.0.5:7000", 6969).unwrap(),
            "10.0.0.5:7000".parse().unwrap()
        );
        assert_eq!(
            resolve_address("10.0.0.5", 6969).unwrap(),
            "10.0.0.5:6969".parse().unwrap()
        );
        assert!(matches!(
            resolve_address("", 6969),
            Err(MachineError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_factory_rejects_unresolved_slave() {
        let slave = Slave::by_serialnumber(DriverKind::Osc, "SN-1", Submode::Torque);
        let result = NetworkDriverFactory.create(&slave, &MachineSettings::default());
        assert!(matches!(result, Err(MachineError::InvalidAddress(_))));
    }

    #[test]
    fn test_loopback_factory_binds_unique_nodes() {
        let network = LoopbackNetwork::new();
        let factory = LoopbackDriverFactory::new(network.clone());
        let slave = Slave::new(DriverKind::Osc, "10.0.0.5:6969", Submode::Torque);
        let a = factory.create(&slave, &MachineSettings::default()).unwrap();
        let b = factory.create(&slave, &MachineSettings::default()).unwrap();
        assert_eq!(network.node_count(), 2);
        assert_eq!(a.kind(), DriverKind::Osc);
        drop((a, b));
        assert_eq!(network.node_count(), 0);
    }
}
