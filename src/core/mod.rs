pub mod id;
pub mod shard;
pub mod value;

pub use id::*;
pub use shard::*;
pub use value::*;
