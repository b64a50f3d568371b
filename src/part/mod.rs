//! Data part model
//!
//! Immutable, date-partitioned, checksummed on-disk artifacts and the
//! partition-aware sets used to reason about which parts are current.

pub mod active_set;
pub mod checksums;
pub mod name;
pub mod store;

pub use active_set::ActivePartSet;
pub use checksums::Checksums;
pub use name::PartName;
pub use store::{PartMeta, PartStore, TempPart};
