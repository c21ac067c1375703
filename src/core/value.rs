use std::fmt;

use crate::core::id::Id;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_NUMBER: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_OTHER: u8 = 0x05;

/// 字段值的字节形式（索引键）。
///
/// 编码保序：同类型内字节序 == 值序；不同类型按 tag 排序
/// （null < false < true < number < string < 其它 JSON）。
/// 数字统一按 f64 编码，超过 2^53 的整数会丢精度。
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldValue(Vec<u8>);

impl FieldValue {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn null() -> Self {
        Self(vec![TAG_NULL])
    }

    pub fn number(v: f64) -> Self {
        // -0.0 与 0.0 归一
        let v = if v == 0.0 { 0.0 } else { v };
        let bits = v.to_bits();
        let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
        let mut out = Vec::with_capacity(9);
        out.push(TAG_NUMBER);
        out.extend_from_slice(&ordered.to_be_bytes());
        Self(out)
    }

    pub fn string(s: &str) -> Self {
        let mut out = Vec::with_capacity(1 + s.len());
        out.push(TAG_STRING);
        out.extend_from_slice(s.as_bytes());
        Self(out)
    }

    /// 还原成 JSON（用于展示）；无法识别的字节返回 None。
    pub fn to_json(&self) -> Option<serde_json::Value> {
        let (&tag, body) = self.0.split_first()?;
        match tag {
            TAG_NULL => Some(serde_json::Value::Null),
            TAG_FALSE => Some(serde_json::Value::Bool(false)),
            TAG_TRUE => Some(serde_json::Value::Bool(true)),
            TAG_NUMBER => {
                let ordered = u64::from_be_bytes(body.try_into().ok()?);
                let bits = if ordered >> 63 == 1 {
                    ordered ^ (1 << 63)
                } else {
                    !ordered
                };
                let v = f64::from_bits(bits);
                if v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
                    Some(serde_json::Value::from(v as i64))
                } else {
                    serde_json::Number::from_f64(v).map(serde_json::Value::Number)
                }
            }
            TAG_STRING => Some(serde_json::Value::String(
                std::str::from_utf8(body).ok()?.to_string(),
            )),
            TAG_OTHER => serde_json::from_slice(body).ok(),
            _ => None,
        }
    }
}

impl From<&serde_json::Value> for FieldValue {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::null(),
            serde_json::Value::Bool(false) => Self(vec![TAG_FALSE]),
            serde_json::Value::Bool(true) => Self(vec![TAG_TRUE]),
            serde_json::Value::Number(n) => Self::number(n.as_f64().unwrap_or(f64::MAX)),
            serde_json::Value::String(s) => Self::string(s),
            other => {
                let mut out = vec![TAG_OTHER];
                out.extend_from_slice(other.to_string().as_bytes());
                Self(out)
            }
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(v: serde_json::Value) -> Self {
        Self::from(&v)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::string(&s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self(vec![if b { TAG_TRUE } else { TAG_FALSE }])
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::number(v as f64)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::number(v as f64)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::number(v as f64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::number(v)
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Some(v) => write!(f, "FieldValue({v})"),
            None => write!(f, "FieldValue({:02x?})", self.0),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Some(v) => write!(f, "{v}"),
            None => write!(f, "{:02x?}", self.0),
        }
    }
}

/// 索引日志中的一条记录；`deleted = true` 为 tombstone，撤销 (value, id) 映射。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub value: FieldValue,
    pub id: Id,
    pub deleted: bool,
}

impl IndexEntry {
    pub fn put(value: FieldValue, id: Id) -> Self {
        Self {
            value,
            id,
            deleted: false,
        }
    }

    pub fn tombstone(value: FieldValue, id: Id) -> Self {
        Self {
            value,
            id,
            deleted: true,
        }
    }

    /// 反向条目：put ↔ tombstone，用于撤销已追加的记录。
    pub fn inverted(&self) -> Self {
        Self {
            value: self.value.clone(),
            id: self.id,
            deleted: !self.deleted,
        }
    }
}
