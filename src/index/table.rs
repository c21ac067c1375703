use std::collections::BTreeMap;
use std::ops::Bound;

use roaring::RoaringTreemap;

use crate::core::{FieldValue, Id, IndexEntry};
use crate::error::Result;
use crate::index::IdSet;
use crate::storage::IndexLog;

/// 单字段的内存索引：FieldValue → Id 集合，只含存活映射。
///
/// 只能通过完整回放 IndexLog 构建；状态是日志条目序列的纯函数。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexTable {
    map: BTreeMap<FieldValue, RoaringTreemap>,
    mappings: u64,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 顺序回放整份日志；损坏帧直接返回错误（由调用方决定是否放弃该字段）。
    pub fn from_log(log: &IndexLog) -> Result<Self> {
        let mut table = Self::new();
        for item in log.replay()? {
            table.apply(&item?.entry);
        }
        Ok(table)
    }

    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a IndexEntry>,
    {
        let mut table = Self::new();
        for e in entries {
            table.apply(e);
        }
        table
    }

    /// put 插入映射；tombstone 删除映射（不存在时 no-op）。返回状态是否变化。
    pub fn apply(&mut self, entry: &IndexEntry) -> bool {
        if entry.deleted {
            self.remove(&entry.value, entry.id)
        } else {
            self.insert(entry.value.clone(), entry.id)
        }
    }

    pub fn insert(&mut self, value: FieldValue, id: Id) -> bool {
        let added = self.map.entry(value).or_default().insert(id.as_u64());
        if added {
            self.mappings += 1;
        }
        added
    }

    pub fn remove(&mut self, value: &FieldValue, id: Id) -> bool {
        let Some(ids) = self.map.get_mut(value) else {
            return false;
        };
        let removed = ids.remove(id.as_u64());
        if removed {
            self.mappings -= 1;
            if ids.is_empty() {
                self.map.remove(value);
            }
        }
        removed
    }

    pub fn lookup(&self, value: &FieldValue) -> IdSet {
        self.map.get(value).cloned().unwrap_or_default()
    }

    /// 闭区间 [low, high]，任一端可为 None（不设界）。
    ///
    /// 按 value 升序，同 value 内按 Id 升序。low > high 时为空。
    pub fn range<'a>(
        &'a self,
        low: Option<&FieldValue>,
        high: Option<&FieldValue>,
    ) -> impl Iterator<Item = (&'a FieldValue, Id)> + 'a {
        let inverted = matches!((low, high), (Some(l), Some(h)) if l > h);
        let lo = match low {
            Some(v) if !inverted => Bound::Included(v.clone()),
            _ => Bound::Unbounded,
        };
        let hi = match high {
            Some(v) if !inverted => Bound::Included(v.clone()),
            _ => Bound::Unbounded,
        };
        let iter = (!inverted).then(|| self.map.range((lo, hi))).into_iter().flatten();
        iter.flat_map(|(v, ids)| ids.iter().map(move |id| (v, Id::from_u64(id))))
    }

    /// range 命中的 Id 并集。
    pub fn range_ids(&self, low: Option<&FieldValue>, high: Option<&FieldValue>) -> IdSet {
        let inverted = matches!((low, high), (Some(l), Some(h)) if l > h);
        let mut out = IdSet::new();
        if inverted {
            return out;
        }
        let lo = low.map_or(Bound::Unbounded, |v| Bound::Included(v.clone()));
        let hi = high.map_or(Bound::Unbounded, |v| Bound::Included(v.clone()));
        for (_, ids) in self.map.range((lo, hi)) {
            out |= ids;
        }
        out
    }

    /// 所有被映射到的 Id。
    pub fn ids(&self) -> IdSet {
        let mut out = IdSet::new();
        for ids in self.map.values() {
            out |= ids;
        }
        out
    }

    /// 当前全部存活映射，顺序同 `range(None, None)`。
    pub fn entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        self.range(None, None)
            .map(|(v, id)| IndexEntry::put(v.clone(), id))
    }

    pub fn distinct_values(&self) -> usize {
        self.map.len()
    }

    pub fn mappings(&self) -> u64 {
        self.mappings
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(set: &IdSet) -> Vec<i64> {
        set.iter().map(|v| v as i64).collect()
    }

    fn color_table() -> IndexTable {
        IndexTable::from_entries(&[
            IndexEntry::put("red".into(), Id(1)),
            IndexEntry::put("blue".into(), Id(2)),
            IndexEntry::put("red".into(), Id(3)),
        ])
    }

    #[test]
    fn equality_lookup() {
        let t = color_table();
        assert_eq!(ids(&t.lookup(&"red".into())), vec![1, 3]);
        assert_eq!(ids(&t.lookup(&"blue".into())), vec![2]);
        assert!(t.lookup(&"green".into()).is_empty());
        assert_eq!(t.mappings(), 3);
        assert_eq!(t.distinct_values(), 2);
    }

    #[test]
    fn tombstone_cancels_and_is_idempotent() {
        let mut t = color_table();
        assert!(t.apply(&IndexEntry::tombstone("red".into(), Id(1))));
        assert!(!t.apply(&IndexEntry::tombstone("red".into(), Id(1))));
        assert!(!t.apply(&IndexEntry::tombstone("green".into(), Id(7))));
        assert_eq!(ids(&t.lookup(&"red".into())), vec![3]);
        assert_eq!(t.mappings(), 2);

        t.apply(&IndexEntry::tombstone("blue".into(), Id(2)));
        assert_eq!(t.distinct_values(), 1);
    }

    #[test]
    fn duplicate_put_counts_once() {
        let mut t = IndexTable::new();
        assert!(t.insert("a".into(), Id(1)));
        assert!(!t.insert("a".into(), Id(1)));
        assert_eq!(t.mappings(), 1);
    }

    #[test]
    fn range_is_ordered_by_value_then_id() {
        let t = IndexTable::from_entries(&[
            IndexEntry::put(30i64.into(), Id(5)),
            IndexEntry::put(10i64.into(), Id(9)),
            IndexEntry::put(20i64.into(), Id(2)),
            IndexEntry::put(10i64.into(), Id(4)),
            IndexEntry::put(40i64.into(), Id(1)),
        ]);

        let got: Vec<(String, i64)> = t
            .range(Some(&10i64.into()), Some(&30i64.into()))
            .map(|(v, id)| (v.to_string(), id.0))
            .collect();
        assert_eq!(
            got,
            vec![
                ("10".to_string(), 4),
                ("10".to_string(), 9),
                ("20".to_string(), 2),
                ("30".to_string(), 5)
            ]
        );

        assert_eq!(ids(&t.range_ids(Some(&25i64.into()), None)), vec![1, 5]);
        assert_eq!(ids(&t.range_ids(None, Some(&10i64.into()))), vec![4, 9]);
        assert_eq!(t.range(None, None).count(), 5);
    }

    #[test]
    fn inverted_range_is_empty() {
        let t = color_table();
        assert_eq!(t.range(Some(&"z".into()), Some(&"a".into())).count(), 0);
        assert!(t.range_ids(Some(&"z".into()), Some(&"a".into())).is_empty());
    }

    #[test]
    fn replaying_twice_yields_identical_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let log = IndexLog::create(tmp.path().join("color"), "color", false).unwrap();
        for e in [
            IndexEntry::put("red".into(), Id(1)),
            IndexEntry::put("blue".into(), Id(2)),
            IndexEntry::put("red".into(), Id(3)),
            IndexEntry::tombstone("red".into(), Id(1)),
        ] {
            log.append(&e).unwrap();
        }

        let a = IndexTable::from_log(&log).unwrap();
        let b = IndexTable::from_log(&log).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.mappings(), 2);
        assert_eq!(ids(&a.lookup(&"red".into())), vec![3]);
    }

    #[test]
    fn n_appends_yield_n_mappings() {
        let tmp = tempfile::tempdir().unwrap();
        let log = IndexLog::create(tmp.path().join("n"), "n", false).unwrap();
        for i in 1..=50 {
            log.append(&IndexEntry::put((i % 7).into(), Id(i))).unwrap();
        }
        assert_eq!(IndexTable::from_log(&log).unwrap().mappings(), 50);
    }
}
