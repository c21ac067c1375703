pub mod registry;
pub mod table;

/// Id 集合（去重、有序，支持交/并/差）。Id 恒为正，直接按 u64 存。
pub type IdSet = roaring::RoaringTreemap;

pub use registry::{validate_field_name, FieldIndex, IndexRegistry};
pub use table::IndexTable;
