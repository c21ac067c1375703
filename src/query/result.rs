use serde::de::DeserializeOwned;

use crate::codec::RecordCodec;
use crate::core::Id;
use crate::error::Result;
use crate::storage::KvStore;

/// 查询结果：惰性、单次遍历。
///
/// 匹配的 Id 在求值时确定，记录在迭代时才逐条读取；
/// 求值之后被删除的记录直接跳过。
pub struct QueryResult<'a, S, C> {
    store: &'a S,
    codec: &'a C,
    ids: std::vec::IntoIter<Id>,
}

impl<'a, S: KvStore, C: RecordCodec> QueryResult<'a, S, C> {
    pub(crate) fn new(store: &'a S, codec: &'a C, ids: Vec<Id>) -> Self {
        Self {
            store,
            codec,
            ids: ids.into_iter(),
        }
    }

    /// 尚未产出的候选 Id 数（上界：被删除的会被跳过）。
    pub fn remaining(&self) -> usize {
        self.ids.len()
    }

    /// 只要 Id，不读记录。
    pub fn ids(self) -> Vec<Id> {
        self.ids.collect()
    }

    /// 逐条解码成 `T`。
    pub fn decode<T>(self) -> impl Iterator<Item = Result<(Id, T)>> + 'a
    where
        T: DeserializeOwned + 'a,
        S: 'a,
        C: 'a,
    {
        let codec = self.codec;
        self.map(move |item| {
            let (id, bytes) = item?;
            Ok((id, codec.decode(&bytes)?))
        })
    }
}

impl<'a, S: KvStore, C: RecordCodec> Iterator for QueryResult<'a, S, C> {
    type Item = Result<(Id, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            match self.store.read(&id.key()) {
                Ok(Some(bytes)) => return Some(Ok((id, bytes))),
                Ok(None) => {
                    tracing::debug!("Record {} vanished before read, skipped", id);
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len()))
    }
}
