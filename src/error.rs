use crate::core::Id;

/// 库内统一的 Result。
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// diskdoc 对外暴露的全部错误。
///
/// 所有失败都原样返回给直接调用方，不做自动重试。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 记录无法编码/解码（只影响当前操作）。
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// 底层存储 I/O 失败。
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    /// 索引日志中途无法解码。
    #[error("index log for field `{field}` is corrupt at offset {offset}: {reason}")]
    CorruptIndex {
        field: String,
        offset: u64,
        reason: &'static str,
    },
    /// 目标 Id 不存在。
    #[error("record {0} not found")]
    NotFound(Id),
    /// add/remove/reindex 失败；集合仍处于可用（可能降级）状态。
    #[error("index operation on field `{field}` failed: {reason}")]
    IndexOperation { field: String, reason: String },
    /// 集合名不能用作目录名。
    #[error("invalid collection name {0:?}")]
    InvalidCollectionName(String),
    /// 配置文件非法。
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn index_op(field: &str, reason: impl ToString) -> Self {
        Error::IndexOperation {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
