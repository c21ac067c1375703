pub mod condition;
pub mod engine;
pub mod result;

pub use condition::*;
pub use engine::*;
pub use result::*;
