#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod codec;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod index;
pub mod query;
pub mod stats;
pub mod storage;

pub use crate::codec::{JsonCodec, RecordCodec};
pub use crate::config::Config;
pub use crate::core::{FieldValue, Id};
pub use crate::db::{Collection, CollectionOptions, Database};
pub use crate::error::{Error, Result};
pub use crate::query::{Condition, QueryResult};
pub use crate::stats::{CollectionStats, VacuumReport};
