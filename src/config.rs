use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::db::CollectionOptions;
use crate::error::{Error, Result};

/// 数据库配置（TOML）。缺省字段取默认值，未知字段报错。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// 数据根目录：`<data_dir>/<collection>/{records,indexes}`
    pub data_dir: PathBuf,
    pub sync_appends: bool,
    pub reuse_ids_on_failed_insert: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_appends: false,
            reuse_ids_on_failed_insert: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("diskdoc")
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("failed to parse config: {e}")))
    }

    pub fn collection_options(&self) -> CollectionOptions {
        CollectionOptions {
            sync_appends: self.sync_appends,
            reuse_ids_on_failed_insert: self.reuse_ids_on_failed_insert,
        }
    }
}
