pub mod json;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::{FieldValue, Id};
use crate::error::Result;

pub use json::JsonCodec;

/// 记录编解码边界：核心只看到不透明字节 + 字段抽取。
pub trait RecordCodec: Send + Sync {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// 抽取字段值；字段缺失返回 `Ok(None)`。
    fn extract(&self, bytes: &[u8], field: &str) -> Result<Option<FieldValue>>;

    /// 一次抽取多个字段（默认逐个调用 `extract`）。
    fn extract_many(&self, bytes: &[u8], fields: &[&str]) -> Result<Vec<Option<FieldValue>>> {
        fields.iter().map(|f| self.extract(bytes, f)).collect()
    }
}

/// 抽取失败（记录无法解码）时按“字段缺失”处理并记 warn。
///
/// 建索引、索引维护与全表扫描共用同一口径：缺失 ≠ 索引条目。
pub(crate) fn extract_lenient<C: RecordCodec>(
    codec: &C,
    id: Id,
    bytes: &[u8],
    field: &str,
) -> Option<FieldValue> {
    match codec.extract(bytes, field) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Record {} not decodable, field {:?} treated as absent: {}", id, field, e);
            None
        }
    }
}

pub(crate) fn extract_many_lenient<C: RecordCodec>(
    codec: &C,
    id: Id,
    bytes: &[u8],
    fields: &[&str],
) -> Vec<Option<FieldValue>> {
    match codec.extract_many(bytes, fields) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Record {} not decodable, fields treated as absent: {}", id, e);
            vec![None; fields.len()]
        }
    }
}
