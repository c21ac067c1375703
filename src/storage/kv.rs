use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::core::shard;

/// 底层 key → bytes 存储。
///
/// 只要求单 key 持久化语义，不保证跨 key 顺序。`keys()` 供全表扫描使用。
pub trait KvStore: Send + Sync {
    fn write(&self, key: &str, value: &[u8]) -> io::Result<()>;
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    /// 返回 key 是否存在过。
    fn erase(&self, key: &str) -> io::Result<bool>;
    fn keys(&self) -> io::Result<Vec<String>>;
}

fn check_key(key: &str) -> io::Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\', '\0']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid store key {key:?}"),
        ));
    }
    Ok(())
}

/// 一 key 一文件，路径由 [`shard`] 决定：`<base>/<seg1>/<seg2>/<key>`。
///
/// 写入走 tmp + rename，读到的要么是旧值要么是新值。
pub struct DiskStore {
    base: PathBuf,
    sync: bool,
}

impl DiskStore {
    pub fn open(base: impl Into<PathBuf>, sync: bool) -> io::Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base, sync })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut p = self.base.clone();
        for seg in shard(key) {
            p.push(seg);
        }
        p.push(key);
        p
    }
}

impl KvStore for DiskStore {
    fn write(&self, key: &str, value: &[u8]) -> io::Result<()> {
        check_key(key)?;
        let path = self.path_for(key);
        let dir = path.parent().unwrap_or(&self.base);
        fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(".{key}.tmp"));
        {
            // 分片目录可能刚被并发的 erase 清理掉
            let mut f = match File::create(&tmp) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir_all(dir)?;
                    File::create(&tmp)?
                }
                r => r?,
            };
            f.write_all(value)?;
            if self.sync {
                f.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)
    }

    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        check_key(key)?;
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn erase(&self, key: &str) -> io::Result<bool> {
        check_key(key)?;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }

        // 清理空的分片目录（非空时 remove_dir 失败，忽略即可）
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.base || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(true)
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.base.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(it) => it,
                Err(e) if e.kind() == io::ErrorKind::NotFound && dir != self.base => continue,
                Err(e) => return Err(e),
            };
            for ent in entries {
                let ent = ent?;
                let ft = ent.file_type()?;
                if ft.is_dir() {
                    stack.push(ent.path());
                } else if ft.is_file() {
                    let Some(name) = ent.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if !name.starts_with('.') {
                        out.push(name);
                    }
                }
            }
        }
        Ok(out)
    }
}

/// 纯内存实现：测试与临时集合用。
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl KvStore for MemStore {
    fn write(&self, key: &str, value: &[u8]) -> io::Result<()> {
        check_key(key)?;
        self.inner.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        check_key(key)?;
        Ok(self.inner.read().get(key).cloned())
    }

    fn erase(&self, key: &str) -> io::Result<bool> {
        check_key(key)?;
        Ok(self.inner.write().remove(key).is_some())
    }

    fn keys(&self) -> io::Result<Vec<String>> {
        Ok(self.inner.read().keys().cloned().collect())
    }
}
