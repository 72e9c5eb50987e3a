pub mod close;
pub mod message;
pub mod result;
pub mod source;

pub use result::{StageResult, StageStatus};
pub use source::{FileEncoding, SourceFile};
