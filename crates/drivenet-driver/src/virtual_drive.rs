//! 进程内模拟驱动器
//!
//! 按标准属性表检查键与读写方向，值保存在内存里。使能时带一阶跟踪：
//! 每次读取 `velocity` / `current_ratio` / `position` 时，实际值向给定值靠近一步。
//! 用于单机调试与测试，[`VirtualDriver::inject`] 可绕过只读限制直接设置反馈值。

use crate::error::DriverError;
use crate::value::Value;
use crate::{AttributeMap, Driver, DriverKind, drive_attributes};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// 每次读取时向给定值靠近的比例
const TRACKING_GAIN: f64 = 0.5;

/// 写入历史保留的条数（环形，只保留最近的写入）
pub const WRITE_HISTORY: usize = 1024;

#[derive(Default)]
struct VirtualState {
    values: HashMap<String, Value>,
    reads: HashMap<String, u64>,
    writes: VecDeque<(String, Value)>,
    /// 跟踪开关：`inject` 过的反馈键不再自动跟踪
    pinned: Vec<String>,
}

/// 模拟驱动器
pub struct VirtualDriver {
    attributes: AttributeMap,
    state: Mutex<VirtualState>,
    connected: AtomicBool,
}

impl Default for VirtualDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDriver {
    pub fn new() -> Self {
        let attributes = drive_attributes();
        let values = attributes
            .iter()
            .map(|(key, attribute)| (key.clone(), default_value(attribute.value_type)))
            .collect();
        Self {
            attributes,
            state: Mutex::new(VirtualState {
                values,
                ..Default::default()
            }),
            connected: AtomicBool::new(false),
        }
    }

    /// 直接设置任意键（包括只读反馈键），之后该键不再自动跟踪
    pub fn inject(&self, key: &str, value: Value) {
        let mut state = self.state.lock();
        state.values.insert(key.to_string(), value);
        if !state.pinned.iter().any(|k| k == key) {
            state.pinned.push(key.to_string());
        }
    }

    /// 不经过读计数地查看当前值
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.state.lock().values.get(key).cloned()
    }

    /// 某个键被 `get` 读取的次数
    pub fn read_count(&self, key: &str) -> u64 {
        self.state.lock().reads.get(key).copied().unwrap_or(0)
    }

    /// 通过 `set` 写入的历史（最近 [`WRITE_HISTORY`] 条，从旧到新）
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.state.lock().writes.iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn track(state: &mut VirtualState) {
        let enabled = matches!(state.values.get("command:enable"), Some(Value::Bool(true)));
        let pairs = [
            ("velocity", "velocity_ref"),
            ("current_ratio", "torque_ref"),
            ("position", "position_ref"),
        ];
        for (actual_key, ref_key) in pairs {
            if state.pinned.iter().any(|k| k == actual_key) {
                continue;
            }
            let target = if enabled {
                state.values.get(ref_key).and_then(Value::as_f64).unwrap_or(0.0)
            } else {
                0.0
            };
            let actual = state
                .values
                .get(actual_key)
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            // 位置不会因为失能而回零
            if !enabled && actual_key == "position" {
                continue;
            }
            let next = actual + (target - actual) * TRACKING_GAIN;
            state.values.insert(actual_key.to_string(), Value::Float(next));
        }
    }
}

fn default_value(value_type: crate::ValueType) -> Value {
    match value_type {
        crate::ValueType::Bool => Value::Bool(false),
        crate::ValueType::Int => Value::Int(0),
        crate::ValueType::Float => Value::Float(0.0),
        crate::ValueType::Str => Value::Str(String::new()),
    }
}

impl Driver for VirtualDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Virtual
    }

    fn connect(&self) -> Result<(), DriverError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn exit(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn get(&self, key: &str) -> Result<Value, DriverError> {
        let attribute = self
            .attributes
            .get(key)
            .ok_or_else(|| DriverError::UnknownKey(key.to_string()))?;
        if !attribute.access.readable() {
            return Err(DriverError::WriteOnly(key.to_string()));
        }

        let mut state = self.state.lock();
        Self::track(&mut state);
        *state.reads.entry(key.to_string()).or_default() += 1;
        state
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| DriverError::UnknownKey(key.to_string()))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), DriverError> {
        let attribute = self
            .attributes
            .get(key)
            .ok_or_else(|| DriverError::UnknownKey(key.to_string()))?;
        if !attribute.access.writable() {
            return Err(DriverError::ReadOnly(key.to_string()));
        }
        let actual = value.value_type();
        let value = value
            .coerce(attribute.value_type)
            .ok_or_else(|| DriverError::WrongType {
                key: key.to_string(),
                expected: attribute.value_type,
                actual,
            })?;

        trace!(key, %value, "virtual drive write");
        let mut state = self.state.lock();
        if state.writes.len() == WRITE_HISTORY {
            state.writes.pop_front();
        }
        state.writes.push_back((key.to_string(), value.clone()));
        state.values.insert(key.to_string(), value);
        Ok(())
    }

    fn attribute_map(&self) -> AttributeMap {
        self.attributes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType;

    #[test]
    fn test_access_checks() {
        let drive = VirtualDriver::new();
        assert!(matches!(drive.get("nope"), Err(DriverError::UnknownKey(_))));
        assert!(matches!(
            drive.set("velocity", Value::Float(1.0)),
            Err(DriverError::ReadOnly(_))
        ));
        assert!(matches!(
            drive.set("go", Value::from("yes")),
            Err(DriverError::WrongType {
                expected: ValueType::Bool,
                actual: ValueType::Str,
                ..
            })
        ));
    }

    #[test]
    fn test_set_coerces_and_logs() {
        let drive = VirtualDriver::new();
        drive.set("velocity_ref", Value::Int(3)).unwrap();
        assert_eq!(drive.peek("velocity_ref"), Some(Value::Float(3.0)));
        assert_eq!(drive.writes(), vec![("velocity_ref".to_string(), Value::Float(3.0))]);
    }

    #[test]
    fn test_write_history_keeps_only_recent_entries() {
        let drive = VirtualDriver::new();
        let total = WRITE_HISTORY * 3;
        for i in 0..total {
            drive.set("velocity_ref", Value::Float(i as f64)).unwrap();
        }
        let writes = drive.writes();
        assert_eq!(writes.len(), WRITE_HISTORY);
        assert_eq!(writes[0].1, Value::Float((total - WRITE_HISTORY) as f64));
        assert_eq!(writes.last().unwrap().1, Value::Float((total - 1) as f64));
    }

    #[test]
    fn test_inject_pins_feedback_and_counts_reads() {
        let drive = VirtualDriver::new();
        drive.inject("velocity", Value::Float(10.0));
        drive.set("command:enable", Value::Bool(true)).unwrap();

        assert_eq!(drive.get("velocity").unwrap(), Value::Float(10.0));
        assert_eq!(drive.get("velocity").unwrap(), Value::Float(10.0));
        assert_eq!(drive.read_count("velocity"), 2);
        assert_eq!(drive.read_count("position"), 0);
    }

    #[test]
    fn test_tracking_follows_reference_when_enabled() {
        let drive = VirtualDriver::new();
        drive.set("velocity_ref", Value::Float(8.0)).unwrap();
        assert_eq!(drive.get("velocity").unwrap(), Value::Float(0.0));

        drive.set("command:enable", Value::Bool(true)).unwrap();
        assert_eq!(drive.get("velocity").unwrap(), Value::Float(4.0));
        assert_eq!(drive.get("velocity").unwrap(), Value::Float(6.0));
    }
}
