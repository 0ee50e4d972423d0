//! 从机值变换规则
//!
//! 配置写法：`"forward"`、`"multiply 2.0"`、`"divide 4"`、`"add 1"`、`"subtract 0.5"`、
//! `"default 0"`。规则名与操作数之间可用空格、`=` 或 `:` 分隔。

use crate::error::TransformError;
use drivenet_driver::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 单个键的变换规则
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Transform {
    /// 原样转发
    #[default]
    Forward,
    Multiply(f64),
    /// 除数在解析时保证非零
    Divide(f64),
    Add(f64),
    Subtract(f64),
    /// 忽略实时值，总是发送固定值
    Default(Value),
}

/// 目标键 → 变换规则
pub type TransformTable = BTreeMap<String, Transform>;

impl Transform {
    /// 解析规则文本
    pub fn parse(rule: &str) -> Result<Self, TransformError> {
        let rule = rule.trim();
        let (name, operand) = match rule.find([' ', '=', ':']) {
            Some(pos) => (&rule[..pos], Some(rule[pos + 1..].trim())),
            None => (rule, None),
        };
        let operand = operand.filter(|s| !s.is_empty());

        let number = |name: &str| -> Result<f64, TransformError> {
            let text = operand.ok_or_else(|| TransformError::MissingOperand(name.to_string()))?;
            text.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| TransformError::InvalidOperand {
                    rule: name.to_string(),
                    operand: text.to_string(),
                })
        };

        match name.to_ascii_lowercase().as_str() {
            "forward" => Ok(Transform::Forward),
            "multiply" => Ok(Transform::Multiply(number(name)?)),
            "divide" => {
                let divisor = number(name)?;
                if divisor == 0.0 {
                    return Err(TransformError::DivideByZero);
                }
                Ok(Transform::Divide(divisor))
            },
            "add" => Ok(Transform::Add(number(name)?)),
            "subtract" => Ok(Transform::Subtract(number(name)?)),
            "default" => {
                let text = operand.ok_or_else(|| TransformError::MissingOperand(name.to_string()))?;
                Ok(Transform::Default(Value::parse_literal(text)))
            },
            _ => Err(TransformError::UnknownRule(rule.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transform::Forward => "forward",
            Transform::Multiply(_) => "multiply",
            Transform::Divide(_) => "divide",
            Transform::Add(_) => "add",
            Transform::Subtract(_) => "subtract",
            Transform::Default(_) => "default",
        }
    }

    /// 对实时值应用变换
    ///
    /// 数值规则的结果总是 `Float`；目标驱动负责按键类型转换。
    pub fn apply(&self, value: &Value) -> Result<Value, TransformError> {
        match self {
            Transform::Forward => Ok(value.clone()),
            Transform::Default(constant) => Ok(constant.clone()),
            &Transform::Multiply(k) => numeric_with(value, self.name(), |v| v * k),
            &Transform::Divide(k) => numeric_with(value, self.name(), |v| v / k),
            &Transform::Add(k) => numeric_with(value, self.name(), |v| v + k),
            &Transform::Subtract(k) => numeric_with(value, self.name(), |v| v - k),
        }
    }
}

fn numeric_with(
    value: &Value,
    rule: &'static str,
    op: impl Fn(f64) -> f64,
) -> Result<Value, TransformError> {
    value
        .as_f64()
        .map(|v| Value::Float(op(v)))
        .ok_or_else(|| TransformError::NotNumeric {
            rule,
            value: value.to_string(),
        })
}

impl FromStr for Transform {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Transform::parse(s)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Forward => write!(f, "forward"),
            Transform::Multiply(k) | Transform::Divide(k) | Transform::Add(k) | Transform::Subtract(k) => {
                write!(f, "{} {k}", self.name())
            },
            Transform::Default(v) => write!(f, "default {v}"),
        }
    }
}

/// 从 `(key, rule)` 对构建变换表，遇到无效规则立即失败
pub fn parse_table<'a>(
    rules: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<TransformTable, (String, TransformError)> {
    rules
        .into_iter()
        .map(|(key, rule)| {
            Transform::parse(rule)
                .map(|t| (key.to_string(), t))
                .map_err(|e| (key.to_string(), e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules() {
        assert_eq!(Transform::parse("forward").unwrap(), Transform::Forward);
        assert_eq!(Transform::parse("multiply 2.0").unwrap(), Transform::Multiply(2.0));
        assert_eq!(Transform::parse("multiply=2.0").unwrap(), Transform::Multiply(2.0));
        assert_eq!(Transform::parse("Divide: 4").unwrap(), Transform::Divide(4.0));
        assert_eq!(Transform::parse("add 1").unwrap(), Transform::Add(1.0));
        assert_eq!(Transform::parse("subtract 0.5").unwrap(), Transform::Subtract(0.5));
        assert_eq!(
            Transform::parse("default true").unwrap(),
            Transform::Default(Value::Bool(true))
        );
    }

    #[test]
    fn test_parse_rejects_bad_rules() {
        assert_eq!(
            Transform::parse("scale 2"),
            Err(TransformError::UnknownRule("scale 2".into()))
        );
        assert_eq!(
            Transform::parse("multiply"),
            Err(TransformError::MissingOperand("multiply".into()))
        );
        assert!(matches!(
            Transform::parse("add x"),
            Err(TransformError::InvalidOperand { .. })
        ));
        assert_eq!(Transform::parse("divide 0"), Err(TransformError::DivideByZero));
    }

    #[test]
    fn test_apply() {
        let v = Value::Float(10.0);
        assert_eq!(Transform::Forward.apply(&v).unwrap(), v);
        assert_eq!(Transform::Multiply(2.0).apply(&v).unwrap(), Value::Float(20.0));
        assert_eq!(Transform::Divide(4.0).apply(&v).unwrap(), Value::Float(2.5));
        assert_eq!(Transform::Add(1.0).apply(&Value::Int(2)).unwrap(), Value::Float(3.0));
        assert_eq!(Transform::Subtract(1.0).apply(&v).unwrap(), Value::Float(9.0));
        assert_eq!(
            Transform::Default(Value::Float(0.0)).apply(&v).unwrap(),
            Value::Float(0.0)
        );
        // 非数值只能转发或使用固定值
        let mode = Value::from("absolute");
        assert_eq!(Transform::Forward.apply(&mode).unwrap(), mode);
        assert!(matches!(
            Transform::Multiply(2.0).apply(&mode),
            Err(TransformError::NotNumeric { rule: "multiply", .. })
        ));
    }

    #[test]
    fn test_parse_table_fails_fast() {
        let table = parse_table([("velocity_ref", "multiply 2"), ("torque_ref", "forward")]).unwrap();
        assert_eq!(table.len(), 2);

        let (key, err) = parse_table([("velocity_ref", "bogus")]).unwrap_err();
        assert_eq!(key, "velocity_ref");
        assert!(matches!(err, TransformError::UnknownRule(_)));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for rule in ["forward", "multiply 2", "divide 4", "default 0.5"] {
            let t = Transform::parse(rule).unwrap();
            assert_eq!(Transform::parse(&t.to_string()).unwrap(), t);
        }
    }
}
