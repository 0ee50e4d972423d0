//! 带保护间隔的读缓存
//!
//! 主机循环每个周期要为每台从机读取本地源键。同一个键在保护间隔内只读一次驱动，
//! 读取频率与从机数量无关。静态键（加减速、转矩上升/下降时间）优先使用最近一次
//! 显式写入的值，完全不读驱动。

use crate::submode::is_static_key;
use drivenet_driver::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct GuardedValues {
    interval: Duration,
    entries: HashMap<String, (Value, Instant)>,
    statics: HashMap<String, Value>,
}

impl GuardedValues {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            entries: HashMap::new(),
            statics: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 读取 `key` 的权威值
    ///
    /// 缓存值未超过保护间隔时直接返回，否则调用 `read` 并刷新时间戳。
    /// `read` 失败时不写缓存。
    pub fn read<E>(
        &mut self,
        key: &str,
        now: Instant,
        read: impl FnOnce(&str) -> Result<Value, E>,
    ) -> Result<Value, E> {
        if is_static_key(key)
            && let Some(value) = self.statics.get(key)
        {
            return Ok(value.clone());
        }

        if let Some((value, at)) = self.entries.get(key)
            && now.saturating_duration_since(*at) < self.interval
        {
            return Ok(value.clone());
        }

        let value = read(key)?;
        self.entries.insert(key.to_string(), (value.clone(), now));
        Ok(value)
    }

    /// 记录静态键的显式写入
    pub fn remember_static(&mut self, key: &str, value: Value) {
        if is_static_key(key) {
            self.statics.insert(key.to_string(), value);
        }
    }

    /// 丢弃一个键的缓存（本地写入后下次读取立即生效）
    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.statics.clear();
    }
}
