use std::collections::HashMap;

use rayon::prelude::*;

use crate::codec::{extract_lenient, extract_many_lenient, RecordCodec};
use crate::core::{FieldValue, Id};
use crate::error::Result;
use crate::index::{IdSet, IndexRegistry};
use crate::query::condition::Condition;
use crate::storage::KvStore;

/// 单次查询的求值上下文（无跨查询状态）。
///
/// - 有索引的叶子走 `IndexTable::lookup/range`；
/// - 没有索引的叶子共享一次全表扫描（记录只读一次，按字段缓存抽取结果）；
/// - `Not` / `True` 需要全集：列出存储中的全部 Id（只列 key，不读记录）。
pub struct QueryEngine<'a, S, C> {
    store: &'a S,
    codec: &'a C,
    registry: &'a IndexRegistry,
    universe: Option<IdSet>,
    records: Option<Vec<(Id, Vec<u8>)>>,
    columns: HashMap<String, Vec<(Id, Option<FieldValue>)>>,
    index_hits: usize,
}

impl<'a, S: KvStore, C: RecordCodec> QueryEngine<'a, S, C> {
    pub fn new(store: &'a S, codec: &'a C, registry: &'a IndexRegistry) -> Self {
        Self {
            store,
            codec,
            registry,
            universe: None,
            records: None,
            columns: HashMap::new(),
            index_hits: 0,
        }
    }

    /// 求值入口：返回去重后的匹配 Id 集合。
    pub fn evaluate(&mut self, cond: &Condition) -> Result<IdSet> {
        let fields = cond.fields();
        let out = if !fields.is_empty() && fields.iter().all(|f| !self.registry.contains(f)) {
            self.scan_predicate(cond)?
        } else {
            self.eval(cond)?
        };
        tracing::debug!(
            "Query evaluated: matches={} index_hits={} scanned_records={} scanned_fields={}",
            out.len(),
            self.index_hits,
            self.records.as_ref().map_or(0, Vec::len),
            self.columns.len()
        );
        Ok(out)
    }

    /// 按字段值升序排列 `ids`（同值按 Id），缺该字段的记录按 Id 排在最后。
    ///
    /// 有索引时直接沿 `IndexTable::range` 顺序输出。
    pub fn order_by(&mut self, ids: &IdSet, field: &str) -> Result<Vec<Id>> {
        let mut out = Vec::with_capacity(ids.len() as usize);
        let mut seen = IdSet::new();

        if let Some(fi) = self.registry.get(field) {
            for (_, id) in fi.table().range(None, None) {
                if ids.contains(id.as_u64()) && seen.insert(id.as_u64()) {
                    out.push(id);
                }
            }
        } else {
            let mut keyed: Vec<(&FieldValue, Id)> = self
                .column(field)?
                .iter()
                .filter(|(id, _)| ids.contains(id.as_u64()))
                .filter_map(|(id, v)| v.as_ref().map(|v| (v, *id)))
                .collect();
            keyed.sort();
            for (_, id) in keyed {
                if seen.insert(id.as_u64()) {
                    out.push(id);
                }
            }
        }

        out.extend(ids.iter().filter(|id| !seen.contains(*id)).map(Id::from_u64));
        Ok(out)
    }

    fn eval(&mut self, cond: &Condition) -> Result<IdSet> {
        match cond {
            Condition::True => Ok(self.universe()?.clone()),
            Condition::Equals { field, value } => match self.registry.get(field) {
                Some(fi) => {
                    self.index_hits += 1;
                    Ok(fi.table().lookup(value))
                }
                None => self.scan_leaf(field, cond),
            },
            Condition::Range { field, low, high } => match self.registry.get(field) {
                Some(fi) => {
                    self.index_hits += 1;
                    Ok(fi.table().range_ids(low.as_ref(), high.as_ref()))
                }
                None => self.scan_leaf(field, cond),
            },
            Condition::And(cs) => {
                if cs.is_empty() {
                    return Ok(self.universe()?.clone());
                }
                // 先算纯索引分支，交集为空时后面的扫描分支可以跳过
                let mut ordered: Vec<&Condition> = cs.iter().collect();
                ordered.sort_by_key(|c| !self.is_index_only(c));

                let mut acc: Option<IdSet> = None;
                for c in ordered {
                    let s = self.eval(c)?;
                    let next = match acc {
                        None => s,
                        Some(mut a) => {
                            a &= s;
                            a
                        }
                    };
                    if next.is_empty() {
                        return Ok(next);
                    }
                    acc = Some(next);
                }
                Ok(acc.unwrap_or_default())
            }
            Condition::Or(cs) => {
                let mut acc = IdSet::new();
                for c in cs {
                    acc |= self.eval(c)?;
                }
                Ok(acc)
            }
            Condition::Not(c) => {
                let inner = self.eval(c)?;
                let mut all = self.universe()?.clone();
                all -= inner;
                Ok(all)
            }
        }
    }

    /// 子树只依赖索引（不需要全集、不需要扫描）。
    fn is_index_only(&self, cond: &Condition) -> bool {
        match cond {
            Condition::True | Condition::Not(_) => false,
            Condition::Equals { field, .. } | Condition::Range { field, .. } => {
                self.registry.contains(field)
            }
            Condition::And(cs) => !cs.is_empty() && cs.iter().all(|c| self.is_index_only(c)),
            Condition::Or(cs) => cs.iter().all(|c| self.is_index_only(c)),
        }
    }

    fn universe(&mut self) -> Result<&IdSet> {
        if self.universe.is_none() {
            let ids: IdSet = self
                .store
                .keys()?
                .iter()
                .filter_map(|k| Id::from_key(k))
                .map(Id::as_u64)
                .collect();
            self.universe = Some(ids);
        }
        Ok(self.universe.get_or_insert_with(IdSet::new))
    }

    fn ensure_records(&mut self) -> Result<()> {
        if self.records.is_some() {
            return Ok(());
        }
        let ids: Vec<Id> = self.universe()?.iter().map(Id::from_u64).collect();
        let store = self.store;
        let loaded = ids
            .par_iter()
            .map(|id| store.read(&id.key()).map(|r| r.map(|b| (*id, b))))
            .collect::<std::io::Result<Vec<_>>>()?;
        self.records = Some(loaded.into_iter().flatten().collect());
        Ok(())
    }

    fn column(&mut self, field: &str) -> Result<&[(Id, Option<FieldValue>)]> {
        if !self.columns.contains_key(field) {
            self.ensure_records()?;
            let codec = self.codec;
            let records = self.records.as_deref().unwrap_or_default();
            let col: Vec<(Id, Option<FieldValue>)> = records
                .par_iter()
                .map(|(id, bytes)| (*id, extract_lenient(codec, *id, bytes, field)))
                .collect();
            self.columns.insert(field.to_string(), col);
        }
        Ok(self.columns.get(field).map(Vec::as_slice).unwrap_or_default())
    }

    fn scan_leaf(&mut self, field: &str, leaf: &Condition) -> Result<IdSet> {
        Ok(self
            .column(field)?
            .iter()
            .filter(|(_, v)| leaf.leaf_matches(v.as_ref()))
            .map(|(id, _)| id.as_u64())
            .collect())
    }

    /// 整棵谓词都不涉及索引：每条记录解码一次，直接判定。
    fn scan_predicate(&mut self, cond: &Condition) -> Result<IdSet> {
        self.ensure_records()?;
        let fields: Vec<&str> = cond.fields().into_iter().collect();
        let codec = self.codec;
        let records = self.records.as_deref().unwrap_or_default();
        let matched: Vec<u64> = records
            .par_iter()
            .filter_map(|(id, bytes)| {
                let values = extract_many_lenient(codec, *id, bytes, &fields);
                let mut get = |f: &str| {
                    fields
                        .iter()
                        .position(|x| *x == f)
                        .and_then(|i| values.get(i).cloned().flatten())
                };
                cond.matches(&mut get).then_some(id.as_u64())
            })
            .collect();
        Ok(matched.into_iter().collect())
    }
}
