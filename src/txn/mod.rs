pub mod changes;
pub mod read_source;
pub mod recovery_unit;

pub use changes::Change;
pub use read_source::ReadSource;
pub use recovery_unit::RecoveryUnit;

/// Opaque 64-bit logical timestamp. Zero is the null timestamp.
pub type Timestamp = u64;
pub const TS_NONE: Timestamp = 0;

/// Process-unique identifier of a transaction's read view.
pub type SnapshotId = u64;
