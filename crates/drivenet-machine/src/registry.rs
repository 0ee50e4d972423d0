//! `machine:` 命名空间的键注册表
//!
//! 构造时把本机直接属性（序列号、地址、工作模式、主机地址）与驱动报告的属性表合并，
//! 之后不再修改。每个模式对象共享同一张表，不存在跨实例修改。

use crate::error::MachineError;
use drivenet_driver::{Access, AttributeMap, Value, ValueType};
use std::collections::BTreeMap;

/// 键的取值来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolver {
    /// 由机器对象直接回答
    Direct,
    /// 转发给本地驱动
    Driver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub value_type: ValueType,
    pub access: Access,
    pub resolver: Resolver,
}

/// 直接属性
pub const DIRECT_KEYS: [(&str, ValueType, Access); 4] = [
    ("serialnumber", ValueType::Str, Access::ReadOnly),
    ("address", ValueType::Str, Access::ReadOnly),
    ("operating_mode", ValueType::Str, Access::ReadWrite),
    ("master", ValueType::Str, Access::ReadOnly),
];

#[derive(Debug, Clone)]
pub struct KeyRegistry {
    keys: BTreeMap<String, KeyDescriptor>,
}

impl KeyRegistry {
    /// 合并直接属性与驱动属性表（同名时直接属性优先）
    pub fn new(driver_map: &AttributeMap) -> Self {
        let mut keys: BTreeMap<String, KeyDescriptor> = driver_map
            .iter()
            .map(|(key, attribute)| {
                (
                    key.clone(),
                    KeyDescriptor {
                        value_type: attribute.value_type,
                        access: attribute.access,
                        resolver: Resolver::Driver,
                    },
                )
            })
            .collect();

        for (key, value_type, access) in DIRECT_KEYS {
            keys.insert(
                key.to_string(),
                KeyDescriptor {
                    value_type,
                    access,
                    resolver: Resolver::Direct,
                },
            );
        }
        Self { keys }
    }

    pub fn descriptor(&self, key: &str) -> Option<&KeyDescriptor> {
        self.keys.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = (&str, &KeyDescriptor)> {
        self.keys.iter().map(|(k, d)| (k.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// 检查读权限
    pub fn check_read(&self, key: &str) -> Result<&KeyDescriptor, MachineError> {
        let descriptor = self
            .descriptor(key)
            .ok_or_else(|| MachineError::UnknownKey(key.to_string()))?;
        if !descriptor.access.readable() {
            return Err(MachineError::WriteOnly(key.to_string()));
        }
        Ok(descriptor)
    }

    /// 检查写权限并把值转换为键的类型
    pub fn check_write(&self, key: &str, value: Value) -> Result<(&KeyDescriptor, Value), MachineError> {
        let descriptor = self
            .descriptor(key)
            .ok_or_else(|| MachineError::UnknownKey(key.to_string()))?;
        if !descriptor.access.writable() {
            return Err(MachineError::ReadOnly(key.to_string()));
        }
        let actual = value.value_type();
        let value = value
            .coerce(descriptor.value_type)
            .ok_or_else(|| MachineError::WrongType {
                key: key.to_string(),
                expected: descriptor.value_type,
                actual,
            })?;
        Ok((descriptor, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivenet_driver::drive_attributes;

    #[test]
    fn test_merges_direct_and_driver_keys() {
        let registry = KeyRegistry::new(&drive_attributes());
        assert_eq!(
            registry.descriptor("operating_mode").unwrap().resolver,
            Resolver::Direct
        );
        assert_eq!(
            registry.descriptor("velocity_ref").unwrap().resolver,
            Resolver::Driver
        );
        assert_eq!(registry.len(), drive_attributes().len() + DIRECT_KEYS.len());
    }

    #[test]
    fn test_access_checks() {
        let registry = KeyRegistry::new(&drive_attributes());
        assert!(matches!(
            registry.check_write("velocity", Value::Float(1.0)),
            Err(MachineError::ReadOnly(_))
        ));
        assert!(matches!(
            registry.check_write("serialnumber", Value::from("x")),
            Err(MachineError::ReadOnly(_))
        ));
        assert!(matches!(registry.check_read("nope"), Err(MachineError::UnknownKey(_))));
        assert!(matches!(
            registry.check_write("go", Value::from("yes")),
            Err(MachineError::WrongType { .. })
        ));

        let (_, value) = registry.check_write("velocity_ref", Value::Int(3)).unwrap();
        assert_eq!(value, Value::Float(3.0));
    }
}
