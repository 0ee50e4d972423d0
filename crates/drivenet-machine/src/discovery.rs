//! 机器发现与在线机器表
//!
//! 发现方广播 `/identify`（参数为回复端口），收到的机器回复
//! `/alive (serialnumber, "ip:port[/cidr]")` 或 `/alive (serialnumber, ip, port)`。
//! 应答由响应线程交给 [`Machine::update_alive_machines`](crate::Machine::update_alive_machines)，
//! 按 (序列号, IP) 写入 [`AliveRegistry`]。
//!
//! 超过存活期限没有再出现的条目在下一次发现周期被清除。
//! 在线机器表可保存为 JSON 文件，重启后恢复；文件丢失时重新发现即可。

use crate::error::DatastoreError;
use drivenet_protocol::{Arg, Message};
use drivenet_transport::{Transport, TransportError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const IDENTIFY_PATH: &str = "/identify";
pub const ALIVE_PATH: &str = "/alive";

/// 一条 `/alive` 通告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub serialnumber: String,
    pub address: SocketAddr,
    /// 子网前缀长度
    pub cidr: Option<u8>,
}

/// 解析 `/alive` 消息
///
/// 通告中的 IP 为未指定地址（`0.0.0.0`）时，用消息来源的 IP 代替。
pub fn parse_alive(msg: &Message) -> Option<Announcement> {
    if msg.path() != ALIVE_PATH {
        return None;
    }
    let (serialnumber, address, cidr) = match msg.args() {
        [Arg::Str(serial), Arg::Str(address)] => {
            let (address, cidr) = match address.split_once('/') {
                Some((addr, cidr)) => (addr, Some(cidr.parse::<u8>().ok()?)),
                None => (address.as_str(), None),
            };
            (serial, address.parse::<SocketAddr>().ok()?, cidr)
        },
        [Arg::Str(serial), Arg::Str(ip), port] => {
            let ip = ip.parse::<IpAddr>().ok()?;
            let port = u16::try_from(port.as_i64()?).ok()?;
            (serial, SocketAddr::new(ip, port), None)
        },
        _ => return None,
    };

    let address = match msg.sender() {
        Some(sender) if address.ip().is_unspecified() => SocketAddr::new(sender.ip(), address.port()),
        _ => address,
    };
    Some(Announcement {
        serialnumber: serialnumber.clone(),
        address,
        cidr,
    })
}

/// 构造本机的 `/alive` 通告
pub fn alive_message(serialnumber: &str, address: &str) -> Message {
    Message::new(ALIVE_PATH).arg(serialnumber).arg(address)
}

/// 在线机器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveMachine {
    pub serialnumber: String,
    pub address: SocketAddr,
    pub cidr: Option<u8>,
    pub last_seen: Instant,
}

/// 持久化格式（不含时间戳）
#[derive(Debug, Serialize, Deserialize)]
struct StoredMachine {
    serialnumber: String,
    address: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cidr: Option<u8>,
}

/// 在线机器表
pub struct AliveRegistry {
    ttl: Duration,
    entries: RwLock<HashMap<(String, IpAddr), AliveMachine>>,
}

impl AliveRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 写入或刷新一条记录，返回是否为新机器
    pub fn upsert(&self, announcement: &Announcement, now: Instant) -> bool {
        let key = (announcement.serialnumber.clone(), announcement.address.ip());
        let machine = AliveMachine {
            serialnumber: announcement.serialnumber.clone(),
            address: announcement.address,
            cidr: announcement.cidr,
            last_seen: now,
        };
        let is_new = self.entries.write().insert(key, machine).is_none();
        if is_new {
            info!(
                serial = %announcement.serialnumber,
                address = %announcement.address,
                "machine discovered"
            );
        }
        is_new
    }

    /// 清除超过存活期限的记录
    pub fn prune(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, m| now.saturating_duration_since(m.last_seen) <= self.ttl);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "stale alive entries pruned");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn snapshot(&self) -> Vec<AliveMachine> {
        let mut machines: Vec<AliveMachine> = self.entries.read().values().cloned().collect();
        machines.sort_by(|a, b| a.serialnumber.cmp(&b.serialnumber).then(a.address.cmp(&b.address)));
        machines
    }

    /// 按序列号查找（同一序列号有多个 IP 时取最近出现的）
    pub fn find_by_serial(&self, serialnumber: &str) -> Option<AliveMachine> {
        self.entries
            .read()
            .values()
            .filter(|m| m.serialnumber == serialnumber)
            .max_by_key(|m| m.last_seen)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// 保存为 JSON
    pub fn save(&self, path: &Path) -> Result<(), DatastoreError> {
        let stored: Vec<StoredMachine> = self
            .snapshot()
            .into_iter()
            .map(|m| StoredMachine {
                serialnumber: m.serialnumber,
                address: m.address,
                cidr: m.cidr,
            })
            .collect();
        std::fs::write(path, serde_json::to_vec_pretty(&stored)?)?;
        Ok(())
    }

    /// 从 JSON 恢复，恢复的记录视为刚出现；文件不存在时返回 0
    pub fn load(&self, path: &Path, now: Instant) -> Result<usize, DatastoreError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let stored: Vec<StoredMachine> = serde_json::from_slice(&data)?;
        let count = stored.len();
        let mut entries = self.entries.write();
        for m in stored {
            entries.insert(
                (m.serialnumber.clone(), m.address.ip()),
                AliveMachine {
                    serialnumber: m.serialnumber,
                    address: m.address,
                    cidr: m.cidr,
                    last_seen: now,
                },
            );
        }
        Ok(count)
    }
}

/// 发现请求的发送方
pub struct Discovery {
    transport: Arc<dyn Transport>,
    registry: Arc<AliveRegistry>,
    reply_port: u16,
}

impl Discovery {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<AliveRegistry>, reply_port: u16) -> Self {
        Self {
            transport,
            registry,
            reply_port,
        }
    }

    pub fn registry(&self) -> &Arc<AliveRegistry> {
        &self.registry
    }

    /// 清空在线机器表并广播发现请求
    pub fn discover(&self) -> Result<(), TransportError> {
        self.registry.clear();
        self.broadcast_identify()
    }

    /// 周期性发现：只清除过期记录，然后广播
    pub fn refresh(&self, now: Instant) -> Result<(), TransportError> {
        self.registry.prune(now);
        self.broadcast_identify()
    }

    fn broadcast_identify(&self) -> Result<(), TransportError> {
        let msg = Message::new(IDENTIFY_PATH).arg(i32::from(self.reply_port));
        debug!(port = self.reply_port, "broadcasting identify");
        self.transport.broadcast(&msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivenet_transport::LoopbackNetwork;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn announcement(serial: &str, address: &str) -> Announcement {
        Announcement {
            serialnumber: serial.into(),
            address: addr(address),
            cidr: None,
        }
    }

    #[test]
    fn test_parse_alive_forms() {
        let two = alive_message("SN-1", "10.0.0.5:6969/24");
        assert_eq!(
            parse_alive(&two),
            Some(Announcement {
                serialnumber: "SN-1".into(),
                address: addr("10.0.0.5:6969"),
                cidr: Some(24),
            })
        );

        let three = Message::new(ALIVE_PATH).arg("SN-2").arg("10.0.0.6").arg(7000);
        assert_eq!(parse_alive(&three), Some(announcement("SN-2", "10.0.0.6:7000")));

        // 未指定地址用来源 IP 补全
        let unspecified = alive_message("SN-3", "0.0.0.0:6969").from_sender(addr("10.0.0.7:40000"));
        assert_eq!(parse_alive(&unspecified).unwrap().address, addr("10.0.0.7:6969"));

        assert_eq!(parse_alive(&Message::new(ALIVE_PATH).arg("SN-1")), None);
        assert_eq!(parse_alive(&alive_message("SN-1", "not-an-address")), None);
        assert_eq!(parse_alive(&Message::new("/ping").arg("a").arg("b")), None);
    }

    #[test]
    fn test_registry_upsert_and_prune() {
        let registry = AliveRegistry::new(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(registry.upsert(&announcement("SN-1", "10.0.0.5:6969"), t0));
        assert!(!registry.upsert(&announcement("SN-1", "10.0.0.5:7000"), t0));
        assert!(registry.upsert(&announcement("SN-1", "10.0.0.9:6969"), t0));
        assert!(registry.upsert(&announcement("SN-2", "10.0.0.6:6969"), t0 + Duration::from_secs(8)));
        assert_eq!(registry.len(), 3);

        // 同序列号取最近出现的
        registry.upsert(&announcement("SN-1", "10.0.0.9:6969"), t0 + Duration::from_secs(5));
        assert_eq!(registry.find_by_serial("SN-1").unwrap().address, addr("10.0.0.9:6969"));

        assert_eq!(registry.prune(t0 + Duration::from_secs(12)), 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.find_by_serial("SN-3").is_none());
    }

    #[test]
    fn test_datastore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alive.json");

        let registry = AliveRegistry::new(Duration::from_secs(10));
        assert_eq!(registry.load(&path, Instant::now()).unwrap(), 0);
        registry.upsert(&announcement("SN-1", "10.0.0.5:6969"), Instant::now());
        registry.save(&path).unwrap();

        let restored = AliveRegistry::new(Duration::from_secs(10));
        assert_eq!(restored.load(&path, Instant::now()).unwrap(), 1);
        assert_eq!(restored.find_by_serial("SN-1").unwrap().address, addr("10.0.0.5:6969"));

        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            restored.load(&path, Instant::now()),
            Err(DatastoreError::Format(_))
        ));
    }

    #[test]
    fn test_discover_clears_and_broadcasts() {
        let network = LoopbackNetwork::new();
        let me = Arc::new(network.bind(addr("10.0.0.1:6969")));
        let peer = network.bind(addr("10.0.0.2:6969"));

        let registry = Arc::new(AliveRegistry::new(Duration::from_secs(10)));
        registry.upsert(&announcement("SN-OLD", "10.0.0.9:6969"), Instant::now());
        let discovery = Discovery::new(me, registry.clone(), 6969);
        discovery.discover().unwrap();

        assert!(registry.is_empty());
        let msg = peer.receive(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.path(), IDENTIFY_PATH);
        assert_eq!(msg.args(), &[Arg::Int(6969)]);
        assert_eq!(msg.sender(), Some(addr("10.0.0.1:6969")));
    }
}
