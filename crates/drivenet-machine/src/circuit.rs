//! 连续错误熔断与全局致命事件

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// 每个从机会话独占的熔断器
///
/// 连续错误达到阈值时熔断；任何一次成功清零计数。熔断状态只能显式复位。
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: AtomicU32,
    tripped: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    /// 记录一次错误，返回是否仍在阈值以内
    pub fn record_error(&self) -> bool {
        let errors = self.consecutive.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        errors < self.threshold
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    /// 标记熔断，仅第一次调用返回 `true`
    pub fn trip(&self) -> bool {
        !self.tripped.swap(true, Ordering::AcqRel)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn reset(&self) {
        self.consecutive.store(0, Ordering::Release);
        self.tripped.store(false, Ordering::Release);
    }
}

/// 所有会话共享的致命事件
///
/// 置位后所有会话的巡检循环进入"始终失能"分支，直到被清除。
#[derive(Debug, Default)]
pub struct FatalEvent {
    set: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl FatalEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, reason: impl Into<String>) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.set.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.reason.lock().take();
        self.set.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// 第一次置位的原因
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}
