use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::core::IndexEntry;
use crate::error::{Error, Result};
use crate::index::table::IndexTable;
use crate::storage::compact::write_log_atomic;
use crate::storage::IndexLog;

/// 字段名同时是日志文件名，只接受安全的单段名字。
pub fn validate_field_name(field: &str) -> Result<()> {
    let bad = field.is_empty()
        || field.len() > 255
        || field.starts_with('.')
        || field.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::index_op(field, "invalid field name"));
    }
    Ok(())
}

/// 一个已索引字段：磁盘日志 + 内存表。
///
/// `record` 在持有表写锁期间追加日志，保证日志顺序 == 表的应用顺序。
pub struct FieldIndex {
    log: IndexLog,
    table: RwLock<IndexTable>,
}

impl FieldIndex {
    fn load(path: &Path, field: &str, sync: bool) -> Result<Self> {
        let log = IndexLog::open(path, field, sync)?;
        let table = IndexTable::from_log(&log)?;
        Ok(Self {
            log,
            table: RwLock::new(table),
        })
    }

    fn build(path: &Path, field: &str, entries: Vec<IndexEntry>, sync: bool) -> Result<Self> {
        let table = IndexTable::from_entries(&entries);
        let log = write_log_atomic(path, field, entries, sync)?;
        Ok(Self {
            log,
            table: RwLock::new(table),
        })
    }

    pub fn field(&self) -> &str {
        self.log.field()
    }

    pub fn log(&self) -> &IndexLog {
        &self.log
    }

    pub fn table(&self) -> parking_lot::RwLockReadGuard<'_, IndexTable> {
        self.table.read()
    }

    /// 先落日志再更新内存表；日志写失败时表保持不变。
    pub fn record(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut table = self.table.write();
        self.log.append_all(entries)?;
        for e in entries {
            table.apply(e);
        }
        Ok(())
    }
}

/// 字段名 → FieldIndex 的显式注册表。
///
/// 只在打开集合时列一次索引目录，此后不再隐式发现。
pub struct IndexRegistry {
    dir: PathBuf,
    sync: bool,
    fields: BTreeMap<String, FieldIndex>,
}

impl IndexRegistry {
    /// 创建（若缺失）索引目录，并回放其中每个字段日志。
    ///
    /// 单个日志损坏只会让该字段不被索引（记录 warn），不影响集合打开。
    pub fn load(dir: impl Into<PathBuf>, sync: bool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut fields = BTreeMap::new();
        for ent in std::fs::read_dir(&dir)? {
            let Ok(ent) = ent else { continue };
            if !ent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(field) = ent.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_field_name(&field).is_err() {
                continue;
            }
            match FieldIndex::load(&ent.path(), &field, sync) {
                Ok(fi) => {
                    tracing::debug!(
                        "Index loaded: field={} mappings={}",
                        field,
                        fi.table().mappings()
                    );
                    fields.insert(field, fi);
                }
                Err(e) => {
                    tracing::warn!("loadIndex {:?} failed, field left unindexed: {}", ent.path(), e);
                }
            }
        }

        Ok(Self { dir, sync, fields })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, field: &str) -> PathBuf {
        self.dir.join(field)
    }

    pub fn get(&self, field: &str) -> Option<&FieldIndex> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldIndex> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// 以给定条目原子写出新日志并注册（覆盖同名的未注册/损坏文件）。
    pub fn create(&mut self, field: &str, entries: Vec<IndexEntry>) -> Result<&FieldIndex> {
        validate_field_name(field)?;
        let fi = FieldIndex::build(&self.path_for(field), field, entries, self.sync)?;
        self.fields.insert(field.to_string(), fi);
        Ok(&self.fields[field])
    }

    /// 先从注册表移除，再删文件；删文件失败时注册表不回滚。
    pub fn remove(&mut self, field: &str) -> Result<()> {
        let fi = self
            .fields
            .remove(field)
            .ok_or_else(|| Error::index_op(field, "field is not indexed"))?;
        fi.log
            .delete_field_log()
            .map_err(|e| Error::index_op(field, e))
    }
}
