use std::fmt;

use crate::core::Id;

/// 集合级统计
#[derive(Clone, Debug, Default)]
pub struct CollectionStats {
    pub name: String,
    /// 存储中的记录数（不含元数据 key）
    pub records: u64,
    /// 下一个将分配的 Id
    pub next_id: Option<Id>,
    pub indexes: Vec<IndexStats>,
}

#[derive(Clone, Debug, Default)]
pub struct IndexStats {
    pub field: String,
    /// 不同字段值个数
    pub distinct_values: usize,
    /// 存活映射数
    pub mappings: u64,
    /// 日志文件大小（字节，含 tombstone 等历史）
    pub log_bytes: u64,
}

impl CollectionStats {
    pub fn total_log_bytes(&self) -> u64 {
        self.indexes.iter().map(|i| i.log_bytes).sum()
    }
}

/// vacuum 的结果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VacuumReport {
    pub fields: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// 指向已不存在记录的映射（被丢弃）
    pub dropped_mappings: u64,
    pub stale_tmp_removed: usize,
}

pub(crate) fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for CollectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║ Collection: {:<36} ║", self.name)?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║   records:      {:>10}                       ║", self.records)?;
        match self.next_id {
            Some(id) => writeln!(f, "║   next id:      {:>10}                       ║", id.0)?,
            None => writeln!(f, "║   next id:      {:>10}                       ║", "-")?,
        }
        writeln!(
            f,
            "║   index logs:   {:>10}                       ║",
            human_bytes(self.total_log_bytes())
        )?;
        for idx in &self.indexes {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Index: {:<41} ║", idx.field)?;
            writeln!(
                f,
                "║   values:       {:>10}                       ║",
                idx.distinct_values
            )?;
            writeln!(f, "║   mappings:     {:>10}                       ║", idx.mappings)?;
            writeln!(
                f,
                "║   log:          {:>10}                       ║",
                human_bytes(idx.log_bytes)
            )?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

impl fmt::Display for VacuumReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vacuumed {} index(es): {} -> {}, dropped {} stale mapping(s), removed {} tmp file(s)",
            self.fields,
            human_bytes(self.bytes_before),
            human_bytes(self.bytes_after),
            self.dropped_mappings,
            self.stale_tmp_removed
        )
    }
}
