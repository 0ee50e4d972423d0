//! 键值类型

use drivenet_protocol::Arg;
use std::fmt;

/// 值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Str,
}

/// 驱动属性值
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Str(_) => ValueType::Str,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// 转换为目标类型（只允许无损/约定俗成的转换）
    ///
    /// - Int → Float
    /// - 整数值的 Float → Int
    /// - Int 0/1 → Bool
    /// - Bool → Int
    pub fn coerce(self, target: ValueType) -> Option<Value> {
        match (self, target) {
            (v, t) if v.value_type() == t => Some(v),
            (Value::Int(v), ValueType::Float) => Some(Value::Float(v as f64)),
            (Value::Float(v), ValueType::Int) if v.fract() == 0.0 => Some(Value::Int(v as i64)),
            (Value::Int(v @ (0 | 1)), ValueType::Bool) => Some(Value::Bool(v == 1)),
            (Value::Bool(v), ValueType::Int) => Some(Value::Int(i64::from(v))),
            _ => None,
        }
    }

    /// 解析配置中的字面量：布尔、整数、浮点，其余视为字符串
    pub fn parse_literal(s: &str) -> Value {
        let s = s.trim();
        match s {
            "true" | "True" | "on" | "yes" => return Value::Bool(true),
            "false" | "False" | "off" | "no" => return Value::Bool(false),
            _ => {},
        }
        if let Ok(v) = s.parse::<i64>() {
            return Value::Int(v);
        }
        if let Ok(v) = s.parse::<f64>() {
            return Value::Float(v);
        }
        Value::Str(s.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(v) => Arg::Bool(v),
            Value::Int(v) => match i32::try_from(v) {
                Ok(small) => Arg::Int(small),
                Err(_) => Arg::Long(v),
            },
            Value::Float(v) => Arg::Float(v),
            Value::Str(v) => Arg::Str(v),
        }
    }
}

impl TryFrom<&Arg> for Value {
    type Error = ();

    fn try_from(arg: &Arg) -> Result<Self, Self::Error> {
        match arg {
            Arg::Int(v) => Ok(Value::Int(i64::from(*v))),
            Arg::Long(v) => Ok(Value::Int(*v)),
            Arg::Float(v) => Ok(Value::Float(*v)),
            Arg::Str(v) => Ok(Value::Str(v.clone())),
            Arg::Bool(v) => Ok(Value::Bool(*v)),
            Arg::Nil => Err(()),
        }
    }
}
