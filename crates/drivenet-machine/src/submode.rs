//! 从机子模式与转发键表

use crate::error::MachineError;
use std::fmt;
use std::str::FromStr;

/// 一个转发键：从主机本地 `source` 读取，写到从机的 `dest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardKey {
    pub dest: &'static str,
    pub source: &'static str,
}

const fn same(key: &'static str) -> ForwardKey {
    ForwardKey {
        dest: key,
        source: key,
    }
}

const fn mapped(dest: &'static str, source: &'static str) -> ForwardKey {
    ForwardKey { dest, source }
}

/// 无论子模式如何都转发给所有从机的控制命令（不经过变化抑制）
pub const ALWAYS_FORWARD: [&str; 4] = [
    "command:enable",
    "command:cancel",
    "command:clear_errors",
    "command:reset",
];

/// 很少变化的参数：主机循环使用最近一次显式写入的值，而不是重新读驱动
pub const STATIC_KEYS: [&str; 4] = [
    "acceleration",
    "deceleration",
    "torque_rise_time",
    "torque_fall_time",
];

const TORQUE: &[ForwardKey] = &[
    same("torque_ref"),
    same("torque_rise_time"),
    same("torque_fall_time"),
];

const ENHANCED_TORQUE: &[ForwardKey] = &[
    mapped("torque_ref", "current_ratio"),
    mapped("velocity_ref", "velocity"),
    same("torque_rise_time"),
    same("torque_fall_time"),
];

const VELOCITY: &[ForwardKey] = &[
    mapped("velocity_ref", "velocity"),
    same("acceleration"),
    same("deceleration"),
];

const POSITION: &[ForwardKey] = &[
    same("move_mode"),
    same("go"),
    same("set_home"),
    same("go_home"),
    same("velocity_ref"),
    same("position_ref"),
    same("acceleration"),
    same("deceleration"),
];

/// 从机子模式（从机以哪种控制方式跟随主机）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Submode {
    #[default]
    Torque,
    EnhancedTorque,
    Velocity,
    Position,
}

impl Submode {
    pub const ALL: [Submode; 4] = [
        Submode::Torque,
        Submode::EnhancedTorque,
        Submode::Velocity,
        Submode::Position,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Submode::Torque => "torque",
            Submode::EnhancedTorque => "enhanced_torque",
            Submode::Velocity => "velocity",
            Submode::Position => "position",
        }
    }

    /// 该子模式下需要持续转发的键
    pub fn forward_keys(self) -> &'static [ForwardKey] {
        match self {
            Submode::Torque => TORQUE,
            Submode::EnhancedTorque => ENHANCED_TORQUE,
            Submode::Velocity => VELOCITY,
            Submode::Position => POSITION,
        }
    }
}

impl fmt::Display for Submode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Submode {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Submode::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| MachineError::InvalidSubmode(s.to_string()))
    }
}

pub fn is_always_forward(key: &str) -> bool {
    ALWAYS_FORWARD.contains(&key)
}

pub fn is_static_key(key: &str) -> bool {
    STATIC_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_tables() {
        let velocity = Submode::Velocity.forward_keys();
        assert_eq!(velocity[0], mapped("velocity_ref", "velocity"));
        assert_eq!(velocity.len(), 3);

        let enhanced = Submode::EnhancedTorque.forward_keys();
        assert!(enhanced.contains(&mapped("torque_ref", "current_ratio")));
        assert_eq!(Submode::Position.forward_keys().len(), 8);
        assert!(Submode::Torque.forward_keys().iter().all(|k| k.dest == k.source));
    }

    #[test]
    fn test_submode_parse() {
        assert_eq!("Velocity".parse::<Submode>().unwrap(), Submode::Velocity);
        assert_eq!("enhanced-torque".parse::<Submode>().unwrap(), Submode::EnhancedTorque);
        assert!("current".parse::<Submode>().is_err());
    }

    #[test]
    fn test_key_sets() {
        assert!(is_always_forward("command:enable"));
        assert!(!is_always_forward("velocity_ref"));
        assert!(is_static_key("torque_fall_time"));
        assert!(!is_static_key("torque_ref"));
    }
}
