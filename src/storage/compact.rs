use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::IndexEntry;
use crate::error::Result;
use crate::storage::index_log::{encode_frame, write_header, IndexLog};

fn tmp_path_for(path: &Path, field: &str) -> PathBuf {
    path.with_file_name(format!(".{field}.tmp"))
}

/// 原子写出一份完整的索引日志（建索引 / vacuum 用）。
///
/// 落盘流程：
/// 1) 写 `.<field>.tmp`（header + 全部帧）
/// 2) fsync(tmp)
/// 3) rename(tmp, target) — 原子替换
/// 4) fsync(dir) — 确保目录项落盘
///
/// 任一步骤前崩溃，target 要么不存在、要么仍是旧日志；残留的 tmp 由 vacuum 清理。
pub fn write_log_atomic<I>(path: &Path, field: &str, entries: I, sync: bool) -> Result<IndexLog>
where
    I: IntoIterator<Item = IndexEntry>,
{
    let tmp = tmp_path_for(path, field);
    let frames = match write_tmp(&tmp, field, entries) {
        Ok(n) => n,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    };

    std::fs::rename(&tmp, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    tracing::debug!("Index log written: field={} frames={}", field, frames);
    IndexLog::open(path, field, sync)
}

fn write_tmp<I>(tmp: &Path, field: &str, entries: I) -> Result<usize>
where
    I: IntoIterator<Item = IndexEntry>,
{
    let file = File::create(tmp)?;
    let mut w = BufWriter::new(file);
    write_header(&mut w)?;
    let mut frames = 0usize;
    for e in entries {
        w.write_all(&encode_frame(field, &e)?)?;
        frames += 1;
    }
    let file = w.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(frames)
}

/// 删除目录中残留的 `.*.tmp`，返回删除个数。
pub fn remove_stale_tmp(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for ent in std::fs::read_dir(dir)? {
        let Ok(ent) = ent else { continue };
        let name = ent.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') && name.ends_with(".tmp") {
            std::fs::remove_file(ent.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
