use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::codec::RecordCodec;
use crate::core::FieldValue;
use crate::error::Result;

/// 记录以 JSON 存储；字段按顶层 key 查找，找不到再按 `a.b.c` 路径逐层下钻。
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

fn lookup<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    let obj = doc.as_object()?;
    if let Some(v) = obj.get(field) {
        return Some(v);
    }
    if !field.contains('.') {
        return None;
    }
    field
        .split('.')
        .try_fold(doc, |cur, part| cur.as_object()?.get(part))
}

impl RecordCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn extract(&self, bytes: &[u8], field: &str) -> Result<Option<FieldValue>> {
        let doc: Value = serde_json::from_slice(bytes)?;
        Ok(lookup(&doc, field).map(FieldValue::from))
    }

    fn extract_many(&self, bytes: &[u8], fields: &[&str]) -> Result<Vec<Option<FieldValue>>> {
        let doc: Value = serde_json::from_slice(bytes)?;
        Ok(fields
            .iter()
            .map(|f| lookup(&doc, f).map(FieldValue::from))
            .collect())
    }
}
