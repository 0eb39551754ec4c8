pub mod aliases;
pub mod records;

pub use aliases::{normalize_name, AliasResolver};
pub use records::{RecordTransform, Transformed};
