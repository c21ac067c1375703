pub mod compact;
pub mod index_log;
pub mod kv;

pub use index_log::{IndexLog, LogReplay, LoggedEntry};
pub use kv::{DiskStore, KvStore, MemStore};
