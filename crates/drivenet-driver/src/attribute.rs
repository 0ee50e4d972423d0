//! 属性表：驱动报告的键、值类型与读写方向

use crate::value::ValueType;
use std::collections::BTreeMap;

/// 读写方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

/// 单个属性描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub value_type: ValueType,
    pub access: Access,
}

impl Attribute {
    pub const fn new(value_type: ValueType, access: Access) -> Self {
        Self { value_type, access }
    }

    pub const fn read_write(value_type: ValueType) -> Self {
        Self::new(value_type, Access::ReadWrite)
    }

    pub const fn read_only(value_type: ValueType) -> Self {
        Self::new(value_type, Access::ReadOnly)
    }
}

/// 键 → 属性描述（有序，便于稳定输出）
pub type AttributeMap = BTreeMap<String, Attribute>;

/// 电机驱动器的标准属性表
///
/// 本地虚拟驱动与远端机器都按这张表报告属性。
pub fn drive_attributes() -> AttributeMap {
    use ValueType::{Bool, Float, Str};

    const TABLE: &[(&str, Attribute)] = &[
        ("command:enable", Attribute::read_write(Bool)),
        ("command:cancel", Attribute::read_write(Bool)),
        ("command:clear_errors", Attribute::read_write(Bool)),
        ("command:reset", Attribute::read_write(Bool)),
        ("go", Attribute::read_write(Bool)),
        ("set_home", Attribute::read_write(Bool)),
        ("go_home", Attribute::read_write(Bool)),
        ("move_mode", Attribute::read_write(Str)),
        ("torque_ref", Attribute::read_write(Float)),
        ("torque_rise_time", Attribute::read_write(Float)),
        ("torque_fall_time", Attribute::read_write(Float)),
        ("velocity_ref", Attribute::read_write(Float)),
        ("position_ref", Attribute::read_write(Float)),
        ("acceleration", Attribute::read_write(Float)),
        ("deceleration", Attribute::read_write(Float)),
        ("velocity", Attribute::read_only(Float)),
        ("current_ratio", Attribute::read_only(Float)),
        ("position", Attribute::read_only(Float)),
    ];

    TABLE
        .iter()
        .map(|(key, attribute)| (key.to_string(), *attribute))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_attributes() {
        let map = drive_attributes();
        assert!(map["command:enable"].access.writable());
        assert!(!map["velocity"].access.writable());
        assert!(map["velocity"].access.readable());
        assert_eq!(map["move_mode"].value_type, ValueType::Str);
    }

    #[test]
    fn test_access_directions() {
        assert!(Access::WriteOnly.writable());
        assert!(!Access::WriteOnly.readable());
        assert!(Access::ReadWrite.readable() && Access::ReadWrite.writable());
    }
}
