mod core;
mod engine;
mod session;
mod txn;

pub use crate::core::errors::MarmotDBError;
pub use crate::core::fail_point::{FailPoint, ALWAYS_NOTIFY_PREPARE_CONFLICT_WAITERS};
pub use crate::core::params::{set_slow_op_threshold_ms, slow_op_threshold_ms};
pub use crate::engine::{EngineError, EngineSession, OplogManager, SessionCache, SnapshotManager};
pub use crate::session::{BeginTxnBlock, RoundToOldest, TxnSession};
pub use crate::txn::{Change, ReadSource, RecoveryUnit, SnapshotId, Timestamp, TS_NONE};

pub type Document = serde_json::Map<String, serde_json::Value>;
