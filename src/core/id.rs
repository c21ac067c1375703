use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::KvStore;

/// 保留的元数据 key：存放下一个待分配的 Id（zigzag varint）。
pub const NEXT_ID_KEY: &str = "_next_id";

/// 记录标识：严格为正、集合内唯一、单调递增、删除后也不复用。
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub i64);

impl Id {
    /// 失败的 insert 对应的“无效 Id”。
    pub const INVALID: Id = Id(0);
    pub const FIRST: Id = Id(1);

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    /// 底层存储里的 key：十进制文本。
    pub fn key(self) -> String {
        self.0.to_string()
    }

    /// 只接受规范形式（"042" 不是 42 的 key）。
    pub fn from_key(key: &str) -> Option<Id> {
        let v = key.parse::<i64>().ok()?;
        let id = Id(v);
        (id.is_valid() && id.key() == key).then_some(id)
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub(crate) fn from_u64(v: u64) -> Id {
        Id(v as i64)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// zigzag + LEB128，与 Go `binary.PutVarint` 的字节布局一致。
pub fn encode_varint(value: i64, buf: &mut Vec<u8>) {
    let mut ux = ((value << 1) ^ (value >> 63)) as u64;
    while ux >= 0x80 {
        buf.push((ux as u8) | 0x80);
        ux >>= 7;
    }
    buf.push(ux as u8);
}

/// 返回 (value, bytes_consumed)；截断或超长返回 None。
pub fn decode_varint(buf: &[u8]) -> Option<(i64, usize)> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 10 {
            return None;
        }
        ux |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            let x = ((ux >> 1) as i64) ^ -((ux & 1) as i64);
            return Some((x, i + 1));
        }
        shift += 7;
    }
    None
}

/// Id 分配器：计数器持久化在 `_next_id` 下，allocate/rollback 互斥。
///
/// 每次 allocate 先把 n+1 落盘再返回 n；持久化失败时内存计数不前进。
pub struct IdAllocator<S> {
    store: Arc<S>,
    next: Mutex<i64>,
}

impl<S: KvStore> IdAllocator<S> {
    /// 读取（必要时初始化为 1）计数器。
    ///
    /// 计数器损坏时按现存最大 Id + 1 修复，避免把已用过的 Id 再发出去。
    pub fn open(store: Arc<S>) -> Result<Self> {
        let next = match store.read(NEXT_ID_KEY)? {
            Some(bytes) => match decode_varint(&bytes).map(|(v, _)| v).filter(|v| *v > 0) {
                Some(v) => v,
                None => {
                    let repaired = max_stored_id(&*store)?.0 + 1;
                    tracing::warn!(
                        "Counter {:?} unreadable ({} bytes), repairing to {}",
                        NEXT_ID_KEY,
                        bytes.len(),
                        repaired
                    );
                    persist(&*store, repaired)?;
                    repaired
                }
            },
            None => {
                persist(&*store, Id::FIRST.0)?;
                Id::FIRST.0
            }
        };
        Ok(Self {
            store,
            next: Mutex::new(next),
        })
    }

    pub fn allocate(&self) -> Result<Id> {
        let mut next = self.next.lock();
        let id = *next;
        let following = id.checked_add(1).ok_or_else(|| {
            Error::Storage(std::io::Error::new(
                std::io::ErrorKind::Other,
                "identifier space exhausted",
            ))
        })?;
        persist(&*self.store, following)?;
        *next = following;
        Ok(Id(id))
    }

    /// 把计数器退回到 `id`，让下一次 allocate 复用它。
    ///
    /// 只有 `id` 之后没有再发出过其它 Id 时才生效；返回是否生效。
    pub fn rollback(&self, id: Id) -> Result<bool> {
        let mut next = self.next.lock();
        if *next != id.0 + 1 {
            tracing::warn!(
                "Rollback of id {} skipped: counter already advanced to {}",
                id,
                *next
            );
            return Ok(false);
        }
        persist(&*self.store, id.0)?;
        *next = id.0;
        Ok(true)
    }

    /// 下一个将被分配的 Id（不消耗）。
    pub fn peek(&self) -> Id {
        Id(*self.next.lock())
    }
}

fn persist<S: KvStore + ?Sized>(store: &S, next: i64) -> Result<()> {
    let mut buf = Vec::with_capacity(10);
    encode_varint(next, &mut buf);
    store.write(NEXT_ID_KEY, &buf)?;
    Ok(())
}

fn max_stored_id<S: KvStore + ?Sized>(store: &S) -> Result<Id> {
    Ok(store
        .keys()?
        .iter()
        .filter_map(|k| Id::from_key(k))
        .max()
        .unwrap_or(Id::INVALID))
}
