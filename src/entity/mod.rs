// Entity snapshots: change tracking and field-level merge
pub mod merge;
pub mod record;

pub use merge::*;
pub use record::*;
