//! 配置存储
//!
//! 机器层只通过 [`ConfigStore`] 读取配置（按节、按键，字符串值 + 类型化读取）。
//! [`TomlConfig`] 是基于 TOML 文档的实现，节名支持点分路径（`slave.left`）。
//!
//! ```toml
//! [machine]
//! serialnumber = "DN-0001"
//! port = 6969
//! slave_refresh_interval = 0.25
//!
//! [slave.left]
//! driver = "osc"
//! address = "10.0.0.5:6969"
//! mode = "velocity"
//!
//! [slave.left.transform]
//! velocity_ref = "multiply 2.0"
//! ```

use crate::error::{ConfigError, MachineError};
use crate::slave::Slave;
use crate::submode::Submode;
use crate::transform::parse_table;
use drivenet_driver::DriverKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::{Table, Value as TomlValue};

/// 默认 UDP 端口
pub const DEFAULT_PORT: u16 = 6969;

/// 键值配置存储
pub trait ConfigStore: Send + Sync {
    /// 读取原始字符串值
    fn get(&self, section: &str, key: &str) -> Option<String>;

    /// 节内所有非表项（键 → 字符串值）
    fn section(&self, section: &str) -> Vec<(String, String)>;

    /// 所有节名（含点分子节）
    fn sections(&self) -> Vec<String>;

    fn has_option(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_some()
    }

    fn get_or(&self, section: &str, key: &str, fallback: &str) -> String {
        self.get(section, key).unwrap_or_else(|| fallback.to_string())
    }

    fn get_int(&self, section: &str, key: &str) -> Result<Option<i64>, ConfigError> {
        self.get(section, key)
            .map(|v| v.trim().parse::<i64>().map_err(|e| invalid(section, key, &v, e)))
            .transpose()
    }

    fn get_float(&self, section: &str, key: &str) -> Result<Option<f64>, ConfigError> {
        self.get(section, key)
            .map(|v| v.trim().parse::<f64>().map_err(|e| invalid(section, key, &v, e)))
            .transpose()
    }

    fn get_bool(&self, section: &str, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get(section, key)
            .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(invalid(section, key, &v, "expected a boolean")),
            })
            .transpose()
    }
}

fn invalid(section: &str, key: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// TOML 配置
#[derive(Debug, Clone, Default)]
pub struct TomlConfig {
    root: Table,
}

impl TomlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            root: text.parse::<Table>()?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// 写入一个值（节不存在时创建），字面量按布尔/整数/浮点/字符串推断
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let mut table = &mut self.root;
        for part in section.split('.') {
            if !table.get(part).is_some_and(TomlValue::is_table) {
                table.insert(part.to_string(), TomlValue::Table(Table::new()));
            }
            let Some(next) = table.get_mut(part).and_then(TomlValue::as_table_mut) else {
                return;
            };
            table = next;
        }
        table.insert(key.to_string(), literal(value));
    }

    fn table(&self, section: &str) -> Option<&Table> {
        section
            .split('.')
            .try_fold(&self.root, |table, part| table.get(part)?.as_table())
    }
}

fn literal(value: &str) -> TomlValue {
    let value = value.trim();
    if let Ok(b) = value.parse::<bool>() {
        TomlValue::Boolean(b)
    } else if let Ok(i) = value.parse::<i64>() {
        TomlValue::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        TomlValue::Float(f)
    } else {
        TomlValue::String(value.to_string())
    }
}

fn scalar_to_string(value: &TomlValue) -> Option<String> {
    match value {
        TomlValue::String(s) => Some(s.clone()),
        TomlValue::Integer(i) => Some(i.to_string()),
        TomlValue::Float(f) => Some(f.to_string()),
        TomlValue::Boolean(b) => Some(b.to_string()),
        TomlValue::Datetime(d) => Some(d.to_string()),
        TomlValue::Array(_) | TomlValue::Table(_) => None,
    }
}

fn collect_sections(prefix: &str, table: &Table, out: &mut Vec<String>) {
    for (name, value) in table {
        if let TomlValue::Table(child) = value {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            out.push(path.clone());
            collect_sections(&path, child, out);
        }
    }
}

impl ConfigStore for TomlConfig {
    fn get(&self, section: &str, key: &str) -> Option<String> {
        self.table(section)?.get(key).and_then(scalar_to_string)
    }

    fn section(&self, section: &str) -> Vec<(String, String)> {
        self.table(section)
            .map(|table| {
                table
                    .iter()
                    .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn sections(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_sections("", &self.root, &mut out);
        out
    }
}

// ==================== 机器参数 ====================

/// `[machine]` 节
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSettings {
    pub serialnumber: String,
    /// 对外公布的地址（`ip:port`），未配置时由端口推导
    pub address: Option<String>,
    pub port: u16,
    pub broadcast: String,
    /// 串口从机与串口本机驱动的波特率
    pub baud_rate: u32,
    pub slave_refresh_interval: Duration,
    pub guard_interval: Duration,
    pub slave_timeout: Duration,
    pub request_timeout: Duration,
    pub bridge_poll_interval: Duration,
    pub error_threshold: u32,
    pub keepalive_interval: Duration,
    pub alive_ttl: Duration,
    pub datastore: Option<PathBuf>,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            serialnumber: "unknown".to_string(),
            address: None,
            port: DEFAULT_PORT,
            broadcast: "255.255.255.255".to_string(),
            baud_rate: 115_200,
            slave_refresh_interval: Duration::from_millis(250),
            guard_interval: Duration::from_millis(30),
            slave_timeout: Duration::from_millis(1500),
            request_timeout: Duration::from_millis(500),
            bridge_poll_interval: Duration::from_secs(1),
            error_threshold: 5,
            keepalive_interval: Duration::from_millis(500),
            alive_ttl: Duration::from_secs(10),
            datastore: None,
        }
    }
}

const MACHINE: &str = "machine";

impl MachineSettings {
    pub fn from_config(config: &dyn ConfigStore) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let seconds = |key: &str, fallback: Duration| -> Result<Duration, ConfigError> {
            match config.get_float(MACHINE, key)? {
                None => Ok(fallback),
                Some(s) if s.is_finite() && s > 0.0 => Ok(Duration::from_secs_f64(s)),
                Some(s) => Err(invalid(MACHINE, key, &s.to_string(), "expected positive seconds")),
            }
        };

        let port = match config.get_int(MACHINE, "port")? {
            None => defaults.port,
            Some(p) => u16::try_from(p)
                .map_err(|_| invalid(MACHINE, "port", &p.to_string(), "out of range"))?,
        };
        let baud_rate = match config.get_int(MACHINE, "baud_rate")? {
            None => defaults.baud_rate,
            Some(b) => u32::try_from(b)
                .ok()
                .filter(|b| *b > 0)
                .ok_or_else(|| invalid(MACHINE, "baud_rate", &b.to_string(), "expected positive integer"))?,
        };
        let error_threshold = match config.get_int(MACHINE, "error_threshold")? {
            None => defaults.error_threshold,
            Some(n) => u32::try_from(n)
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| invalid(MACHINE, "error_threshold", &n.to_string(), "expected >= 1"))?,
        };

        Ok(Self {
            serialnumber: config.get_or(MACHINE, "serialnumber", &defaults.serialnumber),
            address: config.get(MACHINE, "address"),
            port,
            broadcast: config.get_or(MACHINE, "broadcast", &defaults.broadcast),
            baud_rate,
            slave_refresh_interval: seconds("slave_refresh_interval", defaults.slave_refresh_interval)?,
            guard_interval: seconds("guard_interval", defaults.guard_interval)?,
            slave_timeout: seconds("slave_timeout", defaults.slave_timeout)?,
            request_timeout: seconds("request_timeout", defaults.request_timeout)?,
            bridge_poll_interval: seconds("bridge_poll_interval", defaults.bridge_poll_interval)?,
            error_threshold,
            keepalive_interval: seconds("keepalive_interval", defaults.keepalive_interval)?,
            alive_ttl: seconds("alive_ttl", defaults.alive_ttl)?,
            datastore: config.get(MACHINE, "datastore").map(PathBuf::from),
        })
    }

    /// 本机对外地址
    pub fn advertised_address(&self) -> String {
        self.address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }
}

// ==================== 静态从机表 ====================

/// 读取所有 `[slave.<name>]` 节
///
/// 每个从机至少需要 `address` 或 `serialnumber` 之一；变换规则在此处校验，
/// 任何一条无效规则都会使加载失败。
pub fn load_slaves(config: &dyn ConfigStore) -> Result<Vec<Slave>, MachineError> {
    let mut names: Vec<String> = config
        .sections()
        .into_iter()
        .filter_map(|s| {
            s.strip_prefix("slave.")
                .filter(|rest| !rest.contains('.'))
                .map(str::to_string)
        })
        .collect();
    names.sort();

    names
        .iter()
        .map(|name| load_slave(config, name))
        .collect()
}

fn load_slave(config: &dyn ConfigStore, name: &str) -> Result<Slave, MachineError> {
    let section = format!("slave.{name}");
    let kind: DriverKind = config.get_or(&section, "driver", "osc").parse()?;
    let submode: Submode = config.get_or(&section, "mode", Submode::default().as_str()).parse()?;

    let rules = config.section(&format!("{section}.transform"));
    let transforms = parse_table(rules.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .map_err(|(key, source)| ConfigError::Transform {
            slave: name.to_string(),
            key,
            source,
        })?;

    let address = config.get(&section, "address");
    let serialnumber = config.get(&section, "serialnumber");
    let slave = match (address, serialnumber) {
        (Some(address), serial) => {
            let slave = Slave::new(kind, address, submode);
            match serial {
                Some(serial) => slave.with_serialnumber(serial),
                None => slave,
            }
        },
        (None, Some(serial)) => Slave::by_serialnumber(kind, serial, submode),
        (None, None) => {
            return Err(ConfigError::Missing {
                section,
                key: "address".to_string(),
            }
            .into());
        },
    };
    Ok(slave.with_transforms(transforms))
}
