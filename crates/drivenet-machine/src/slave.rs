//! 从机记录（不可变值）
//!
//! 地址或子模式变化时构造新记录替换旧记录，而不是原地修改。

use crate::submode::Submode;
use crate::transform::{Transform, TransformTable};
use drivenet_driver::DriverKind;
use std::fmt;

/// 从机描述
#[derive(Debug, Clone, PartialEq)]
pub struct Slave {
    serialnumber: Option<String>,
    address: Option<String>,
    kind: DriverKind,
    submode: Submode,
    transforms: TransformTable,
}

impl Slave {
    /// 按地址创建（序列号在首次联系前可能未知）
    pub fn new(kind: DriverKind, address: impl Into<String>, submode: Submode) -> Self {
        Self {
            serialnumber: None,
            address: Some(address.into()),
            kind,
            submode,
            transforms: TransformTable::new(),
        }
    }

    /// 只按序列号创建，地址等待发现后补上
    pub fn by_serialnumber(kind: DriverKind, serialnumber: impl Into<String>, submode: Submode) -> Self {
        Self {
            serialnumber: Some(serialnumber.into()),
            address: None,
            kind,
            submode,
            transforms: TransformTable::new(),
        }
    }

    pub fn with_serialnumber(mut self, serialnumber: impl Into<String>) -> Self {
        self.serialnumber = Some(serialnumber.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_submode(mut self, submode: Submode) -> Self {
        self.submode = submode;
        self
    }

    pub fn with_transforms(mut self, transforms: TransformTable) -> Self {
        self.transforms = transforms;
        self
    }

    /// 身份：已知序列号时为序列号，否则为地址
    pub fn identity(&self) -> &str {
        self.serialnumber
            .as_deref()
            .or(self.address.as_deref())
            .unwrap_or("<unknown>")
    }

    /// 是否由 `id` 指代（序列号或地址）
    pub fn matches(&self, id: &str) -> bool {
        self.serialnumber.as_deref() == Some(id) || self.address.as_deref() == Some(id)
    }

    pub fn serialnumber(&self) -> Option<&str> {
        self.serialnumber.as_deref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn submode(&self) -> Submode {
        self.submode
    }

    pub fn transforms(&self) -> &TransformTable {
        &self.transforms
    }

    /// 目标键的变换规则，未配置时原样转发
    pub fn transform_for(&self, dest_key: &str) -> &Transform {
        static FORWARD: Transform = Transform::Forward;
        self.transforms.get(dest_key).unwrap_or(&FORWARD)
    }
}

impl fmt::Display for Slave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.serialnumber, &self.address) {
            (Some(serial), Some(address)) => write!(f, "{serial} ({address})"),
            (Some(serial), None) => write!(f, "{serial} (unresolved)"),
            (None, Some(address)) => write!(f, "{address}"),
            (None, None) => write!(f, "<unknown>"),
        }
    }
}
