use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::db::collection::{Collection, CollectionOptions, INDEXES_DIR, RECORDS_DIR};
use crate::error::{Error, Result};

/// 根目录下的一组命名集合：`<root>/<name>/...`。
///
/// 同一个集合在进程内只打开一次，后续 `collection()` 返回同一个实例。
pub struct Database {
    root: PathBuf,
    options: CollectionOptions,
    open: Mutex<HashMap<String, Arc<Collection>>>,
}

impl Database {
    pub fn open(root: impl Into<PathBuf>, options: CollectionOptions) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        tracing::info!("Database opened at {}", root.display());
        Ok(Self {
            root,
            options,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(&config.data_dir, config.collection_options())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 打开（必要时创建）集合。
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        validate_collection_name(name)?;
        let mut open = self.open.lock();
        if let Some(c) = open.get(name) {
            return Ok(c.clone());
        }
        let c = Arc::new(Collection::open(
            self.root.join(name),
            name,
            self.options.clone(),
        )?);
        open.insert(name.to_string(), c.clone());
        Ok(c)
    }

    /// 磁盘上已有的集合名（含 records/ 或 indexes/ 子目录的目录），升序。
    pub fn collection_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for ent in std::fs::read_dir(&self.root)? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let path = ent.path();
            if !path.join(RECORDS_DIR).is_dir() && !path.join(INDEXES_DIR).is_dir() {
                continue;
            }
            if let Some(name) = ent.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.len() > 255
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::InvalidCollectionName(name.to_string()));
    }
    Ok(())
}
