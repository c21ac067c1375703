use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{extract_lenient, extract_many_lenient, JsonCodec, RecordCodec};
use crate::core::{FieldValue, Id, IdAllocator, IndexEntry};
use crate::error::{Error, Result};
use crate::index::{validate_field_name, FieldIndex, IdSet, IndexRegistry};
use crate::query::{Condition, QueryEngine, QueryResult};
use crate::stats::{CollectionStats, IndexStats, VacuumReport};
use crate::storage::compact::remove_stale_tmp;
use crate::storage::index_log::MAX_VALUE_LEN;
use crate::storage::{DiskStore, KvStore};

pub const RECORDS_DIR: &str = "records";
pub const INDEXES_DIR: &str = "indexes";

#[derive(Clone, Debug, Default)]
pub struct CollectionOptions {
    /// 每次追加索引日志/写记录后 fsync
    pub sync_appends: bool,
    /// insert 写入失败时尝试回退计数器，让该 Id 被下一次 insert 复用
    pub reuse_ids_on_failed_insert: bool,
}

/// 一个命名集合：记录存储 + Id 分配器 + 字段索引。
///
/// 锁顺序：`writes` → `indexes`。insert 不拿 `writes`（新 Id 对其它写者不可见）。
pub struct Collection<S = DiskStore, C = JsonCodec> {
    name: String,
    store: Arc<S>,
    codec: C,
    ids: IdAllocator<S>,
    indexes: RwLock<IndexRegistry>,
    writes: Mutex<()>,
    options: CollectionOptions,
}

impl Collection {
    /// 打开（必要时创建）`<dir>/records` 与 `<dir>/indexes`。
    pub fn open(dir: impl AsRef<Path>, name: &str, options: CollectionOptions) -> Result<Self> {
        let dir = dir.as_ref();
        let store = Arc::new(DiskStore::open(dir.join(RECORDS_DIR), options.sync_appends)?);
        Self::with_store(name, store, JsonCodec, dir.join(INDEXES_DIR), options)
    }
}

impl<S: KvStore, C: RecordCodec> Collection<S, C> {
    pub fn with_store(
        name: &str,
        store: Arc<S>,
        codec: C,
        index_dir: impl Into<PathBuf>,
        options: CollectionOptions,
    ) -> Result<Self> {
        let started = Instant::now();
        let ids = IdAllocator::open(store.clone())?;
        let indexes = IndexRegistry::load(index_dir, options.sync_appends)?;
        tracing::info!(
            "Collection opened: name={} indexes={} next_id={} elapsed={:?}",
            name,
            indexes.len(),
            ids.peek(),
            started.elapsed()
        );
        Ok(Self {
            name: name.to_string(),
            store,
            codec,
            ids,
            indexes: RwLock::new(indexes),
            writes: Mutex::new(()),
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    // ---------------- records ----------------

    pub fn insert<T: Serialize + ?Sized>(&self, value: &T) -> Result<Id> {
        let bytes = self.codec.encode(value)?;
        self.insert_raw(&bytes)
    }

    /// 分配 Id → 写记录 → 为每个已索引字段追加 put。
    ///
    /// 任一步失败都返回错误且不留下记录：已写的记录被删除，已追加的 put
    /// 由 tombstone 抵消。Id 默认作废（留下空洞）。
    pub fn insert_raw(&self, bytes: &[u8]) -> Result<Id> {
        let registry = self.indexes.read();
        let id = self.ids.allocate()?;
        let key = id.key();

        if let Err(e) = self.store.write(&key, bytes) {
            self.abandon_id(id, &e);
            return Err(e.into());
        }

        let batches = self
            .indexed_values(&registry, id, bytes)
            .into_iter()
            .filter_map(|(fi, v)| v.map(|v| (fi, vec![IndexEntry::put(v, id)])))
            .collect();
        if let Err(e) = record_all(id, batches) {
            if let Err(ee) = self.store.erase(&key) {
                tracing::warn!("Erasing record {} after failed insert failed: {}", id, ee);
            }
            self.abandon_id(id, &e);
            return Err(e);
        }
        Ok(id)
    }

    fn abandon_id(&self, id: Id, cause: &dyn std::fmt::Display) {
        if !self.options.reuse_ids_on_failed_insert {
            tracing::warn!("Insert failed, id {} abandoned: {}", id, cause);
            return;
        }
        match self.ids.rollback(id) {
            Ok(true) => tracing::debug!("Insert failed, id {} returned to allocator", id),
            Ok(false) => {}
            Err(re) => tracing::warn!("Rollback of id {} failed: {}", id, re),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, id: Id) -> Result<T> {
        let bytes = self.get_raw(id)?;
        self.codec.decode(&bytes)
    }

    pub fn get_raw(&self, id: Id) -> Result<Vec<u8>> {
        if !id.is_valid() {
            return Err(Error::NotFound(id));
        }
        self.store.read(&id.key())?.ok_or(Error::NotFound(id))
    }

    pub fn update<T: Serialize + ?Sized>(&self, id: Id, value: &T) -> Result<()> {
        let bytes = self.codec.encode(value)?;
        self.update_raw(id, &bytes)
    }

    /// 覆盖记录；值变化的索引字段追加 tombstone(旧) + put(新)。
    ///
    /// 索引追加失败时写回旧记录并撤销已追加的条目。
    pub fn update_raw(&self, id: Id, bytes: &[u8]) -> Result<()> {
        let _w = self.writes.lock();
        let registry = self.indexes.read();
        let old = self.get_raw(id)?;
        let key = id.key();
        self.store.write(&key, bytes)?;

        let before = self.indexed_values(&registry, id, &old);
        let after = self.indexed_values(&registry, id, bytes);
        let mut batches = Vec::new();
        for ((fi, old_v), (_, new_v)) in before.into_iter().zip(after) {
            if old_v == new_v {
                continue;
            }
            let mut entries = Vec::with_capacity(2);
            if let Some(v) = old_v {
                entries.push(IndexEntry::tombstone(v, id));
            }
            if let Some(v) = new_v {
                entries.push(IndexEntry::put(v, id));
            }
            batches.push((fi, entries));
        }
        if let Err(e) = record_all(id, batches) {
            if let Err(we) = self.store.write(&key, &old) {
                tracing::warn!("Restoring record {} after failed update failed: {}", id, we);
            }
            return Err(e);
        }
        Ok(())
    }

    /// 删除记录并为其全部已索引值追加 tombstone；Id 不会再被分配。
    ///
    /// 索引追加失败时写回记录并撤销已追加的 tombstone。
    pub fn delete(&self, id: Id) -> Result<()> {
        let _w = self.writes.lock();
        let registry = self.indexes.read();
        let old = self.get_raw(id)?;
        let key = id.key();
        if !self.store.erase(&key)? {
            return Err(Error::NotFound(id));
        }
        let batches = self
            .indexed_values(&registry, id, &old)
            .into_iter()
            .filter_map(|(fi, v)| v.map(|v| (fi, vec![IndexEntry::tombstone(v, id)])))
            .collect();
        if let Err(e) = record_all(id, batches) {
            if let Err(we) = self.store.write(&key, &old) {
                tracing::warn!("Restoring record {} after failed delete failed: {}", id, we);
            }
            return Err(e);
        }
        Ok(())
    }

    /// 存储中的记录数（不含 `_next_id`）。
    pub fn count(&self) -> Result<u64> {
        Ok(self.live_ids()?.len())
    }

    /// 下一个将分配的 Id。
    pub fn next_id(&self) -> Id {
        self.ids.peek()
    }

    fn live_ids(&self) -> Result<IdSet> {
        Ok(self
            .store
            .keys()?
            .iter()
            .filter_map(|k| Id::from_key(k))
            .map(Id::as_u64)
            .collect())
    }

    fn indexed_values<'r>(
        &self,
        registry: &'r IndexRegistry,
        id: Id,
        bytes: &[u8],
    ) -> Vec<(&'r FieldIndex, Option<FieldValue>)> {
        if registry.is_empty() {
            return Vec::new();
        }
        let fields: Vec<&str> = registry.fields().collect();
        let values = extract_many_lenient(&self.codec, id, bytes, &fields);
        registry.iter().zip(values).collect()
    }

    // ---------------- indexes ----------------

    /// 扫描全部记录为 `field` 建索引；缺该字段的记录不产生条目。
    pub fn add_index(&self, field: &str) -> Result<()> {
        validate_field_name(field)?;
        let mut registry = self.indexes.write();
        if registry.contains(field) {
            return Err(Error::index_op(field, "field is already indexed"));
        }
        self.build_index(&mut registry, field)
    }

    /// 内存表先移除；删日志文件失败不会恢复内存表。
    pub fn remove_index(&self, field: &str) -> Result<()> {
        self.indexes.write().remove(field)?;
        tracing::info!("Index removed: collection={} field={}", self.name, field);
        Ok(())
    }

    /// remove + add，整个过程持有注册表写锁，查询看不到“索引暂时消失”。
    pub fn reindex(&self, field: &str) -> Result<()> {
        let mut registry = self.indexes.write();
        registry.remove(field)?;
        self.build_index(&mut registry, field)
    }

    pub fn indexes(&self) -> Vec<String> {
        self.indexes.read().fields().map(str::to_string).collect()
    }

    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexes.read().contains(field)
    }

    fn build_index(&self, registry: &mut IndexRegistry, field: &str) -> Result<()> {
        let started = Instant::now();
        let mut ids: Vec<Id> = self
            .store
            .keys()
            .map_err(|e| Error::index_op(field, e))?
            .iter()
            .filter_map(|k| Id::from_key(k))
            .collect();
        ids.sort_unstable();

        let scanned = ids.len();
        let entries = ids
            .into_par_iter()
            .map(|id| match self.store.read(&id.key()) {
                Ok(Some(bytes)) => Ok(extract_lenient(&self.codec, id, &bytes, field)
                    .map(|value| IndexEntry::put(value, id))),
                Ok(None) => Ok(None),
                Err(e) => Err(Error::index_op(field, e)),
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .filter(|e| {
                let fits = e.value.as_bytes().len() <= MAX_VALUE_LEN;
                if !fits {
                    tracing::warn!(
                        "Record {} not indexed on {:?}: value of {} bytes exceeds limit",
                        e.id,
                        field,
                        e.value.as_bytes().len()
                    );
                }
                fits
            })
            .collect::<Vec<_>>();

        let written = entries.len();
        registry.create(field, entries).map_err(|e| match e {
            e @ Error::IndexOperation { .. } => e,
            e => Error::index_op(field, e),
        })?;
        tracing::info!(
            "Index built: collection={} field={} records={} entries={} elapsed={:?}",
            self.name,
            field,
            scanned,
            written,
            started.elapsed()
        );
        Ok(())
    }

    // ---------------- query ----------------

    /// 求值在注册表读锁下完成；返回的结果按 Id 升序惰性读取记录。
    pub fn query(&self, cond: &Condition) -> Result<QueryResult<'_, S, C>> {
        let registry = self.indexes.read();
        let ids = QueryEngine::new(&*self.store, &self.codec, &registry).evaluate(cond)?;
        Ok(QueryResult::new(
            &*self.store,
            &self.codec,
            ids.iter().map(Id::from_u64).collect(),
        ))
    }

    /// 同 [`query`](Self::query)，但按 `field` 的值排序。
    pub fn query_ordered(&self, cond: &Condition, field: &str) -> Result<QueryResult<'_, S, C>> {
        let registry = self.indexes.read();
        let mut engine = QueryEngine::new(&*self.store, &self.codec, &registry);
        let ids = engine.evaluate(cond)?;
        let ordered = engine.order_by(&ids, field)?;
        Ok(QueryResult::new(&*self.store, &self.codec, ordered))
    }

    pub fn query_all(&self) -> Result<QueryResult<'_, S, C>> {
        self.query(&Condition::True)
    }

    // ---------------- maintenance ----------------

    /// 用内存表重写每个索引日志（丢掉 tombstone 历史与指向已消失记录的映射）。
    pub fn vacuum(&self) -> Result<VacuumReport> {
        let started = Instant::now();
        let mut registry = self.indexes.write();
        let live = self.live_ids()?;

        let mut report = VacuumReport {
            stale_tmp_removed: remove_stale_tmp(registry.dir())?,
            ..Default::default()
        };

        let fields: Vec<String> = registry.fields().map(str::to_string).collect();
        for field in fields {
            let Some(fi) = registry.get(&field) else { continue };
            report.bytes_before += fi.log().len_bytes()?;
            let mut dropped = 0u64;
            let entries: Vec<IndexEntry> = fi
                .table()
                .entries()
                .filter(|e| {
                    let keep = live.contains(e.id.as_u64());
                    if !keep {
                        dropped += 1;
                    }
                    keep
                })
                .collect();

            let fi = registry.create(&field, entries)?;
            report.bytes_after += fi.log().len_bytes()?;
            report.dropped_mappings += dropped;
            report.fields += 1;
        }

        tracing::info!(
            "Vacuum done: collection={} {} elapsed={:?}",
            self.name,
            report,
            started.elapsed()
        );
        Ok(report)
    }

    pub fn stats(&self) -> Result<CollectionStats> {
        let registry = self.indexes.read();
        let indexes = registry
            .iter()
            .map(|fi| {
                let table = fi.table();
                Ok(IndexStats {
                    field: fi.field().to_string(),
                    distinct_values: table.distinct_values(),
                    mappings: table.mappings(),
                    log_bytes: fi.log().len_bytes()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CollectionStats {
            name: self.name.clone(),
            records: self.count()?,
            next_id: Some(self.ids.peek()),
            indexes,
        })
    }
}

/// 逐字段追加；某字段失败时，先为已成功的字段追加反向条目，再返回原错误。
///
/// 单个 `record` 失败时该字段什么都没应用（日志截断回原长度，表未动）。
fn record_all(id: Id, batches: Vec<(&FieldIndex, Vec<IndexEntry>)>) -> Result<()> {
    for (i, (fi, entries)) in batches.iter().enumerate() {
        let Err(e) = fi.record(entries) else { continue };
        for (done, entries) in batches[..i].iter().rev() {
            let undo: Vec<IndexEntry> = entries.iter().rev().map(IndexEntry::inverted).collect();
            if let Err(ue) = done.record(&undo) {
                tracing::warn!(
                    "Undo on index {:?} for record {} failed, index may be stale until reindex: {}",
                    done.field(),
                    id,
                    ue
                );
            }
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NEXT_ID_KEY;
    use crate::storage::MemStore;
    use serde_json::{json, Value};
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn open(dir: &Path) -> Collection {
        Collection::open(dir, "people", CollectionOptions::default()).unwrap()
    }

    fn ids<S: KvStore, C: RecordCodec>(r: QueryResult<'_, S, C>) -> Vec<i64> {
        r.ids().into_iter().map(|id| id.0).collect()
    }

    fn people(c: &Collection) {
        c.insert(&json!({"name": "ann", "color": "red", "age": 31})).unwrap();
        c.insert(&json!({"name": "bob", "color": "blue", "age": 25})).unwrap();
        c.insert(&json!({"name": "cat", "color": "red", "age": 40})).unwrap();
        c.insert(&json!({"name": "dan", "age": 25})).unwrap();
    }

    /// 同一组谓词：有索引与纯扫描必须得到同样的结果。
    fn probes() -> Vec<Condition> {
        vec![
            Condition::True,
            Condition::eq("color", "red"),
            Condition::eq("age", 25),
            Condition::at_least("age", 30),
            Condition::and([Condition::eq("color", "red"), Condition::at_least("age", 35)]),
            Condition::or([Condition::eq("color", "blue"), Condition::eq("age", 40)]),
            Condition::not(Condition::eq("color", "red")),
        ]
    }

    fn scan_answers(c: &Collection) -> Vec<Vec<i64>> {
        let tmp = tempfile::tempdir().unwrap();
        let plain = Collection::with_store(
            "scan",
            c.store.clone(),
            JsonCodec,
            tmp.path().join("none"),
            CollectionOptions::default(),
        )
        .unwrap();
        probes().iter().map(|p| ids(plain.query(p).unwrap())).collect()
    }

    fn answers(c: &Collection) -> Vec<Vec<i64>> {
        probes().iter().map(|p| ids(c.query(p).unwrap())).collect()
    }

    #[test]
    fn insert_assigns_sequential_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        assert_eq!(c.insert(&json!("a")).unwrap(), Id(1));
        assert_eq!(c.insert(&json!("b")).unwrap(), Id(2));
        assert_eq!(c.insert(&json!("c")).unwrap(), Id(3));
        assert_eq!(c.next_id(), Id(4));
        assert_eq!(c.count().unwrap(), 3);
    }

    #[test]
    fn query_all_returns_every_record() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        c.insert(&json!("a")).unwrap();
        c.insert(&json!("b")).unwrap();

        let got: Vec<(Id, String)> = c
            .query_all()
            .unwrap()
            .decode::<String>()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(got, vec![(Id(1), "a".to_string()), (Id(2), "b".to_string())]);
    }

    #[test]
    fn equality_on_indexed_field() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        c.insert(&json!({"color": "red"})).unwrap();
        c.insert(&json!({"color": "blue"})).unwrap();
        c.insert(&json!({"color": "red"})).unwrap();

        c.add_index("color").unwrap();
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1, 3]);
        assert_eq!(c.indexes(), vec!["color".to_string()]);
    }

    #[test]
    fn get_and_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        let id = c.insert(&json!({"name": "ann"})).unwrap();
        let v: Value = c.get(id).unwrap();
        assert_eq!(v["name"], "ann");

        assert!(matches!(c.get::<Value>(Id(99)), Err(Error::NotFound(Id(99)))));
        assert!(matches!(c.get_raw(Id::INVALID), Err(Error::NotFound(_))));
        assert!(matches!(c.update(Id(99), &json!(1)), Err(Error::NotFound(_))));
        assert!(matches!(c.delete(Id(99)), Err(Error::NotFound(_))));
    }

    #[test]
    fn indexed_and_scanned_results_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        let expected = scan_answers(&c);

        c.add_index("color").unwrap();
        assert_eq!(answers(&c), expected);
        c.add_index("age").unwrap();
        assert_eq!(answers(&c), expected);

        assert_eq!(expected[1], vec![1, 3]);
        assert_eq!(expected[2], vec![2, 4]);
        assert_eq!(expected[6], vec![2, 4]);
    }

    #[test]
    fn update_and_delete_keep_indexes_consistent() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        c.add_index("color").unwrap();
        c.add_index("age").unwrap();

        c.update(Id(1), &json!({"name": "ann", "color": "green", "age": 31})).unwrap();
        c.update(Id(4), &json!({"name": "dan", "color": "red"})).unwrap();
        c.delete(Id(3)).unwrap();

        assert_eq!(answers(&c), scan_answers(&c));
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![4]);
        assert_eq!(ids(c.query(&Condition::eq("age", 25)).unwrap()), vec![2]);

        // 删除后的 Id 不会再被分配
        assert_eq!(c.insert(&json!({})).unwrap(), Id(5));
    }

    #[test]
    fn reopen_replays_index_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let before = {
            let c = open(tmp.path());
            people(&c);
            c.add_index("color").unwrap();
            c.update(Id(2), &json!({"color": "red"})).unwrap();
            c.delete(Id(1)).unwrap();
            answers(&c)
        };

        let c = open(tmp.path());
        assert_eq!(c.indexes(), vec!["color".to_string()]);
        assert_eq!(answers(&c), before);
        assert_eq!(c.next_id(), Id(5));
        let stats = c.stats().unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.indexes[0].mappings, 2);
    }

    #[test]
    fn corrupt_log_leaves_field_unindexed() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let c = open(tmp.path());
            people(&c);
            c.add_index("color").unwrap();
        }
        let log = tmp.path().join(INDEXES_DIR).join("color");
        let mut bytes = std::fs::read(&log).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&log, bytes).unwrap();

        let c = open(tmp.path());
        assert!(!c.is_indexed("color"));
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1, 3]);

        // 重新建索引会覆盖损坏的文件
        c.add_index("color").unwrap();
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1, 3]);
    }

    #[test]
    fn remove_index_falls_back_to_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        c.add_index("color").unwrap();
        c.remove_index("color").unwrap();

        assert!(c.indexes().is_empty());
        assert!(!tmp.path().join(INDEXES_DIR).join("color").exists());
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1, 3]);
        assert!(matches!(
            c.remove_index("color"),
            Err(Error::IndexOperation { .. })
        ));
    }

    #[test]
    fn add_index_rejects_duplicates_and_bad_names() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        c.add_index("color").unwrap();
        assert!(matches!(c.add_index("color"), Err(Error::IndexOperation { .. })));
        assert!(c.add_index("").is_err());
        assert!(c.add_index("../escape").is_err());
    }

    #[test]
    fn add_index_skips_records_without_field() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        c.add_index("color").unwrap();
        let stats = c.stats().unwrap();
        assert_eq!(stats.indexes[0].mappings, 3);
        assert_eq!(stats.indexes[0].distinct_values, 2);
    }

    #[test]
    fn reindex_rebuilds_from_records() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        c.add_index("color").unwrap();
        // 绕过集合直接改存储，索引变旧
        c.store().write("2", br#"{"color":"red"}"#).unwrap();
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1, 3]);

        c.reindex("color").unwrap();
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1, 2, 3]);
        assert!(matches!(c.reindex("age"), Err(Error::IndexOperation { .. })));
    }

    #[test]
    fn query_ordered_by_field() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        let unindexed = ids(c.query_ordered(&Condition::True, "age").unwrap());
        c.add_index("age").unwrap();
        let indexed = ids(c.query_ordered(&Condition::True, "age").unwrap());
        assert_eq!(indexed, vec![2, 4, 1, 3]);
        assert_eq!(unindexed, indexed);

        // 缺字段的记录排最后
        let by_color = ids(c.query_ordered(&Condition::True, "color").unwrap());
        assert_eq!(by_color, vec![2, 1, 3, 4]);
    }

    #[test]
    fn query_result_skips_records_deleted_after_evaluation() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        let result = c.query(&Condition::True).unwrap();
        assert_eq!(result.remaining(), 4);
        c.delete(Id(2)).unwrap();
        let got: Vec<i64> = result.map(|r| r.unwrap().0 .0).collect();
        assert_eq!(got, vec![1, 3, 4]);
    }

    #[test]
    fn vacuum_shrinks_logs_and_preserves_results() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        c.add_index("color").unwrap();
        c.add_index("age").unwrap();
        for round in 0..20 {
            c.update(Id(1), &json!({"color": format!("c{round}"), "age": round})).unwrap();
        }
        c.update(Id(1), &json!({"color": "red", "age": 31})).unwrap();
        // 绕过集合删除记录，留下悬空映射
        c.store().erase("3").unwrap();
        std::fs::write(tmp.path().join(INDEXES_DIR).join(".color.tmp"), b"junk").unwrap();

        let before = scan_answers(&c);
        assert_ne!(answers(&c), before);
        let report = c.vacuum().unwrap();
        assert_eq!(report.fields, 2);
        assert!(report.bytes_after < report.bytes_before);
        assert_eq!(report.dropped_mappings, 2);
        assert_eq!(report.stale_tmp_removed, 1);
        assert_eq!(answers(&c), before);

        drop(c);
        let c = open(tmp.path());
        assert_eq!(answers(&c), before);
    }

    #[test]
    fn concurrent_inserts_get_distinct_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let c = Arc::new(open(tmp.path()));
        c.add_index("worker").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|w| {
                let c = c.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| c.insert(&json!({"worker": w, "i": i})).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<Id> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert_eq!(c.count().unwrap(), 200);
        assert_eq!(c.stats().unwrap().indexes[0].mappings, 200);
        assert_eq!(ids(c.query(&Condition::eq("worker", 3)).unwrap()).len(), 25);
    }

    #[test]
    fn undecodable_record_counts_as_missing_field() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        c.insert(&json!({"color": "red"})).unwrap();
        c.insert_raw(b"\xff not json").unwrap();
        c.add_index("color").unwrap();
        assert_eq!(c.stats().unwrap().indexes[0].mappings, 1);
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1]);
        assert!(c.get::<Value>(Id(2)).is_err());
    }

    /// 记录写入可按需失败的存储（计数器写入不受影响）。
    #[derive(Default)]
    struct FlakyStore {
        inner: MemStore,
        fail_records: AtomicBool,
    }

    impl KvStore for FlakyStore {
        fn write(&self, key: &str, value: &[u8]) -> io::Result<()> {
            if key != NEXT_ID_KEY && self.fail_records.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.inner.write(key, value)
        }
        fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
            self.inner.read(key)
        }
        fn erase(&self, key: &str) -> io::Result<bool> {
            self.inner.erase(key)
        }
        fn keys(&self) -> io::Result<Vec<String>> {
            self.inner.keys()
        }
    }

    fn flaky(dir: &Path, reuse: bool) -> Collection<FlakyStore> {
        Collection::with_store(
            "flaky",
            Arc::new(FlakyStore::default()),
            JsonCodec,
            dir.join(INDEXES_DIR),
            CollectionOptions {
                reuse_ids_on_failed_insert: reuse,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn failed_insert_abandons_id_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let c = flaky(tmp.path(), false);
        c.add_index("color").unwrap();
        assert_eq!(c.insert(&json!({"color": "red"})).unwrap(), Id(1));

        c.store().fail_records.store(true, Ordering::SeqCst);
        assert!(matches!(c.insert(&json!({"color": "red"})), Err(Error::Storage(_))));
        c.store().fail_records.store(false, Ordering::SeqCst);

        assert_eq!(c.insert(&json!({"color": "red"})).unwrap(), Id(3));
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1, 3]);
    }

    #[test]
    fn failed_insert_reuses_id_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let c = flaky(tmp.path(), true);
        assert_eq!(c.insert(&json!(1)).unwrap(), Id(1));

        c.store().fail_records.store(true, Ordering::SeqCst);
        assert!(c.insert(&json!(2)).is_err());
        c.store().fail_records.store(false, Ordering::SeqCst);

        assert_eq!(c.insert(&json!(2)).unwrap(), Id(2));
        assert_eq!(c.count().unwrap(), 2);
    }

    #[test]
    fn index_failure_undoes_insert_and_update() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        c.insert(&json!({"a": 1, "z": "small"})).unwrap();
        c.add_index("a").unwrap();
        c.add_index("z").unwrap();
        let huge = "x".repeat(MAX_VALUE_LEN);

        // "a" 先追加成功，"z" 的值超限失败：记录与 "a" 的 put 都要撤销
        assert!(matches!(
            c.insert(&json!({"a": 2, "z": huge})),
            Err(Error::IndexOperation { .. })
        ));
        assert_eq!(c.count().unwrap(), 1);
        assert!(matches!(c.get_raw(Id(2)), Err(Error::NotFound(_))));
        assert!(ids(c.query(&Condition::eq("a", 2)).unwrap()).is_empty());
        assert_eq!(c.insert(&json!({"a": 3})).unwrap(), Id(3));

        assert!(c.update(Id(1), &json!({"a": 9, "z": huge})).is_err());
        let v: Value = c.get(Id(1)).unwrap();
        assert_eq!(v, json!({"a": 1, "z": "small"}));
        assert_eq!(ids(c.query(&Condition::eq("a", 1)).unwrap()), vec![1]);
        assert!(ids(c.query(&Condition::eq("a", 9)).unwrap()).is_empty());

        drop(c);
        let c = open(tmp.path());
        assert_eq!(c.indexes(), vec!["a".to_string(), "z".to_string()]);
        assert_eq!(ids(c.query(&Condition::eq("a", 1)).unwrap()), vec![1]);
        assert_eq!(ids(c.query(&Condition::eq("a", 3)).unwrap()), vec![3]);
        assert!(ids(c.query(&Condition::eq("a", 2)).unwrap()).is_empty());
        assert_eq!(c.stats().unwrap().indexes[0].mappings, 2);
    }

    #[test]
    fn add_index_skips_values_over_frame_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        c.insert(&json!({"blob": "x".repeat(MAX_VALUE_LEN)})).unwrap();
        c.insert(&json!({"blob": "tiny"})).unwrap();
        c.add_index("blob").unwrap();
        assert_eq!(c.stats().unwrap().indexes[0].mappings, 1);

        drop(c);
        let c = open(tmp.path());
        assert!(c.is_indexed("blob"));
        assert_eq!(ids(c.query(&Condition::eq("blob", "tiny")).unwrap()), vec![2]);
    }

    #[test]
    fn remove_index_keeps_removal_when_log_delete_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        c.add_index("color").unwrap();
        std::fs::remove_file(tmp.path().join(INDEXES_DIR).join("color")).unwrap();

        assert!(matches!(
            c.remove_index("color"),
            Err(Error::IndexOperation { .. })
        ));
        assert!(c.indexes().is_empty());
        assert_eq!(ids(c.query(&Condition::eq("color", "red")).unwrap()), vec![1, 3]);
    }

    #[test]
    fn failed_reindex_leaves_field_unindexed() {
        let tmp = tempfile::tempdir().unwrap();
        let c = open(tmp.path());
        people(&c);
        c.add_index("color").unwrap();
        c.add_index("age").unwrap();

        // 删除日志失败：内存表已移除，不再重建
        std::fs::remove_file(tmp.path().join(INDEXES_DIR).join("color")).unwrap();
        assert!(matches!(c.reindex("color"), Err(Error::IndexOperation { .. })));
        assert_eq!(c.indexes(), vec!["age".to_string()]);

        // 重建失败：tmp 路径被目录占住，写新日志失败
        std::fs::create_dir(tmp.path().join(INDEXES_DIR).join(".age.tmp")).unwrap();
        assert!(matches!(c.reindex("age"), Err(Error::IndexOperation { .. })));
        assert!(c.indexes().is_empty());
        assert_eq!(answers(&c), scan_answers(&c));
    }
}
