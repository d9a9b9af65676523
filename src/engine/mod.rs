//! Interfaces to the underlying storage engine and its shared services.
//!
//! The engine itself lives behind these traits: a recovery unit drives raw,
//! string-configured transaction primitives on an [`EngineSession`] it leases
//! from the [`SessionCache`], and consults the [`OplogManager`] and
//! [`SnapshotManager`] when resolving read timestamps.

use thiserror::Error;
use tracing::error;

use crate::txn::Timestamp;
use crate::Document;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("engine error {code}: {message}")]
    Failed { code: i32, message: String },
}

impl EngineError {
    pub fn code(&self) -> i32 {
        match self {
            // EINVAL
            EngineError::InvalidArgument(_) => 22,
            EngineError::Failed { code, .. } => *code,
        }
    }
}

/// A pooled engine session. One session holds at most one open transaction;
/// dropping the session returns it to the pool.
///
/// Timestamp-bearing configuration strings carry lowercase hex without a
/// leading `0x`: `read_timestamp=<hex>[,round_to_oldest=true]`,
/// `commit_timestamp=<hex>`, `prepare_timestamp=<hex>`.
pub trait EngineSession: Send {
    fn begin_transaction(&mut self, config: &str) -> Result<(), EngineError>;

    fn timestamp_transaction(&mut self, config: &str) -> Result<(), EngineError>;

    fn prepare_transaction(&mut self, config: &str) -> Result<(), EngineError>;

    fn commit_transaction(&mut self) -> Result<(), EngineError>;

    fn rollback_transaction(&mut self) -> Result<(), EngineError>;

    /// Query a transaction timestamp, e.g. `get=read` for the read timestamp
    /// of the open transaction. The response is ASCII hex, at most 16 digits.
    fn query_timestamp(&mut self, config: &str) -> Result<String, EngineError>;

    fn close_all_cursors(&mut self);

    /// Queued ident drops are processed when a session goes back to the pool;
    /// sessions serving internal sampling readers opt out of that work.
    fn set_drop_queued_idents_allowed(&mut self, allowed: bool);

    fn statistics(&self, uri: &str, config: &str) -> Result<Document, EngineError>;
}

/// Hands out engine sessions and fans notifications out to waiters blocked on
/// prepared transactions.
pub trait SessionCache: Send + Sync {
    fn get_session(&self) -> Box<dyn EngineSession>;

    fn wait_until_durable(&self, force_checkpoint: bool, stable_checkpoint: bool);

    fn notify_prepared_unit_of_work_has_committed_or_aborted(&self);

    fn snapshot_manager(&self) -> &dyn SnapshotManager;
}

/// Oplog timestamp source and visibility-flush sink.
pub trait OplogManager: Send + Sync {
    /// The timestamp up to which the oplog may currently be read.
    fn oplog_read_timestamp(&self) -> Timestamp;

    /// The engine's all-committed timestamp: everything at or before it has
    /// committed.
    fn fetch_all_committed(&self) -> Timestamp;

    /// Force a journal flush so oplog visibility catches up.
    fn trigger_journal_flush(&self);
}

/// Resolves replication snapshots to engine timestamps.
pub trait SnapshotManager: Send + Sync {
    /// The minimum snapshot usable for the next committed read, if any
    /// snapshot has been marked committed yet.
    fn committed_snapshot(&self) -> Option<Timestamp>;

    /// The latest locally applied snapshot, if one has been set.
    fn local_snapshot(&self) -> Option<Timestamp>;
}

// Once the engine has failed to commit or roll back, durable state and
// in-memory bookkeeping can no longer be reconciled; continuing risks
// divergence.
pub(crate) fn fatal_engine(context: &str, err: EngineError) -> ! {
    error!(error = %err, "{}", context);
    std::process::abort()
}
