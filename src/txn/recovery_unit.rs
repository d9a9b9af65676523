//! Per-operation transactional handle over the storage engine.
//!
//! A `RecoveryUnit` brackets the reads and writes of one logical operation:
//! it lazily opens an engine transaction at a snapshot chosen by the
//! configured [`ReadSource`], accumulates [`Change`] handlers inside a write
//! unit of work, optionally two-phase-prepares, and finally commits or rolls
//! back with the caller's chosen timestamps.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, Level};

use crate::core::fail_point::ALWAYS_NOTIFY_PREPARE_CONFLICT_WAITERS;
use crate::core::params::slow_op_threshold_ms;
use crate::engine::{fatal_engine, EngineError, OplogManager, SessionCache};
use crate::session::{RoundToOldest, TxnSession};
use crate::{Document, MarmotDBError};

use super::{Change, ReadSource, SnapshotId, Timestamp, TS_NONE};

// Snapshot ids are process-global: a caller may compare ids taken from two
// different recovery units across a yield, so two transactions must never
// share one.
static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

fn next_snapshot_id() -> SnapshotId {
    NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Inactive,
    InactiveInUnitOfWork,
    ActiveNotInUnitOfWork,
    Active,
    Committing,
    Aborting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Inactive => "Inactive",
            State::InactiveInUnitOfWork => "InactiveInUnitOfWork",
            State::ActiveNotInUnitOfWork => "ActiveNotInUnitOfWork",
            State::Active => "Active",
            State::Committing => "Committing",
            State::Aborting => "Aborting",
        };
        f.write_str(name)
    }
}

pub struct RecoveryUnit {
    session_cache: Arc<dyn SessionCache>,
    oplog_manager: Arc<dyn OplogManager>,
    state: State,
    session: Option<TxnSession>,
    changes: Vec<Box<dyn Change>>,
    snapshot_id: SnapshotId,
    read_source: ReadSource,
    read_at_timestamp: Option<Timestamp>,
    majority_committed_snapshot: Option<Timestamp>,
    commit_timestamp: Option<Timestamp>,
    prepare_timestamp: Option<Timestamp>,
    last_timestamp_set: Option<Timestamp>,
    ignore_prepared: bool,
    is_oplog_reader: bool,
    is_timestamped: bool,
    ordered_commit: bool,
    timer: Option<Instant>,
}

impl RecoveryUnit {
    pub fn new(session_cache: Arc<dyn SessionCache>, oplog_manager: Arc<dyn OplogManager>) -> Self {
        Self {
            session_cache,
            oplog_manager,
            state: State::Inactive,
            session: None,
            changes: Vec::new(),
            snapshot_id: next_snapshot_id(),
            read_source: ReadSource::Unset,
            read_at_timestamp: None,
            majority_committed_snapshot: None,
            commit_timestamp: None,
            prepare_timestamp: None,
            last_timestamp_set: None,
            ignore_prepared: false,
            is_oplog_reader: false,
            is_timestamped: false,
            // All writes are assumed ordered until a caller says otherwise.
            ordered_commit: true,
            timer: None,
        }
    }

    /// An engine transaction is open.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::ActiveNotInUnitOfWork | State::Active)
    }

    /// A write unit of work is open.
    pub fn in_unit_of_work(&self) -> bool {
        matches!(self.state, State::InactiveInUnitOfWork | State::Active)
    }

    fn is_committing_or_aborting(&self) -> bool {
        matches!(self.state, State::Committing | State::Aborting)
    }

    fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn begin_unit_of_work(&mut self) {
        assert!(
            !self.in_unit_of_work(),
            "cannot begin a unit of work in state {}",
            self.state
        );
        assert!(
            !self.is_committing_or_aborting(),
            "cannot begin a unit of work while commit or rollback handlers are running: {}",
            self.state
        );
        self.set_state(if self.is_active() {
            State::Active
        } else {
            State::InactiveInUnitOfWork
        });
    }

    pub fn prepare_unit_of_work(&mut self) -> Result<(), MarmotDBError> {
        assert!(
            self.in_unit_of_work(),
            "cannot prepare a unit of work in state {}",
            self.state
        );
        let prepare_timestamp = self
            .prepare_timestamp
            .expect("prepare timestamp must be set before preparing");

        self.get_session()?;
        debug!(prepare_timestamp, "preparing transaction");
        self.session
            .as_mut()
            .expect("session present")
            .prepare_transaction(prepare_timestamp);
        Ok(())
    }

    pub fn commit_unit_of_work(&mut self) {
        assert!(
            self.in_unit_of_work(),
            "cannot commit a unit of work in state {}",
            self.state
        );
        self.commit_inner();
    }

    pub fn abort_unit_of_work(&mut self) {
        assert!(
            self.in_unit_of_work(),
            "cannot abort a unit of work in state {}",
            self.state
        );
        self.abort_inner();
    }

    /// Register a side effect to replay on commit or undo on rollback. Legal
    /// only inside a write unit of work.
    pub fn register_change(&mut self, change: Box<dyn Change>) {
        assert!(
            self.in_unit_of_work(),
            "cannot register a change in state {}",
            self.state
        );
        self.changes.push(change);
    }

    pub fn assert_in_active_txn(&self) {
        if self.is_active() {
            return;
        }
        // The caller is already relying on an open transaction that does not
        // exist; there is no way to recover.
        error!(state = %self.state, "recovery unit is not active");
        process::abort();
    }

    /// The session for this operation, lazily opening an engine transaction
    /// at the snapshot chosen by the configured read source.
    pub fn get_session(&mut self) -> Result<&mut TxnSession, MarmotDBError> {
        if !self.is_active() {
            self.txn_open()?;
            let next = if self.in_unit_of_work() {
                State::Active
            } else {
                State::ActiveNotInUnitOfWork
            };
            self.set_state(next);
        }
        Ok(self.session.as_mut().expect("session opened by txn_open"))
    }

    /// The session without starting a transaction. Queued ident drops are
    /// disabled on it: internal sampling readers must not pick up that work.
    pub fn get_session_no_txn(&mut self) -> &mut TxnSession {
        self.ensure_session();
        let session = self.session.as_mut().expect("session present");
        session.set_drop_queued_idents_allowed(false);
        session
    }

    pub fn abandon_snapshot(&mut self) {
        assert!(
            !self.in_unit_of_work(),
            "cannot abandon a snapshot in state {}",
            self.state
        );
        if self.is_active() {
            // Not in a unit of work, so rolling back cannot lose writes.
            self.txn_close(false);
        }
        self.set_state(State::Inactive);
    }

    /// Begin a transaction now if one is not already open.
    pub fn preallocate_snapshot(&mut self) -> Result<(), MarmotDBError> {
        self.get_session()?;
        Ok(())
    }

    /// Drop any cached cursors before the session sits idle.
    pub fn begin_idle(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close_all_cursors();
        }
    }

    /// Journal flush only; unjournaled writes are unaffected.
    pub fn wait_until_durable(&mut self) {
        assert!(
            !self.in_unit_of_work(),
            "cannot wait for durability in state {}",
            self.state
        );
        self.session_cache.wait_until_durable(false, false);
    }

    /// A journal flush alone cannot cover unjournaled tables; a stable
    /// checkpoint locks their writes in.
    pub fn wait_until_unjournaled_writes_durable(&mut self) {
        assert!(
            !self.in_unit_of_work(),
            "cannot wait for durability in state {}",
            self.state
        );
        self.session_cache.wait_until_durable(true, true);
    }

    /// Assign `timestamp` to every write in the open unit of work, opening
    /// the transaction if necessary.
    pub fn set_timestamp(&mut self, timestamp: Timestamp) -> Result<(), MarmotDBError> {
        self.ensure_session();
        trace!(timestamp, "setting timestamp of future write operations");
        assert!(
            self.in_unit_of_work(),
            "cannot set a timestamp in state {}",
            self.state
        );
        assert!(
            self.prepare_timestamp.is_none(),
            "cannot set a unit-of-work timestamp on a prepared transaction"
        );
        assert!(
            self.commit_timestamp.is_none(),
            "commit timestamp already set to {:?} while setting unit-of-work timestamp {}",
            self.commit_timestamp,
            timestamp
        );

        self.last_timestamp_set = Some(timestamp);

        // Starts the engine transaction associated with this session.
        self.get_session()?;
        match self
            .session
            .as_mut()
            .expect("session present")
            .apply_commit_timestamp(timestamp)
        {
            Ok(()) => {
                self.is_timestamped = true;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fix the commit timestamp ahead of time. Legal outside a unit of work,
    /// or inside one only once the transaction has been prepared; prepared
    /// transactions rely on exactly this set-once behavior.
    pub fn set_commit_timestamp(&mut self, timestamp: Timestamp) {
        assert!(
            !self.in_unit_of_work() || self.prepare_timestamp.is_some(),
            "cannot set a commit timestamp in state {}",
            self.state
        );
        assert!(
            self.commit_timestamp.is_none(),
            "commit timestamp already set to {:?} while setting it to {}",
            self.commit_timestamp,
            timestamp
        );
        assert!(
            self.last_timestamp_set.is_none(),
            "unit-of-work timestamp already set to {:?} while setting commit timestamp {}",
            self.last_timestamp_set,
            timestamp
        );
        assert!(!self.is_timestamped);

        self.commit_timestamp = Some(timestamp);
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        self.commit_timestamp
    }

    pub fn clear_commit_timestamp(&mut self) {
        assert!(
            !self.in_unit_of_work(),
            "cannot clear the commit timestamp in state {}",
            self.state
        );
        assert!(self.commit_timestamp.is_some());
        assert!(
            self.last_timestamp_set.is_none(),
            "unit-of-work timestamp set to {:?} while clearing the commit timestamp",
            self.last_timestamp_set
        );
        assert!(!self.is_timestamped);

        self.commit_timestamp = None;
    }

    pub fn set_prepare_timestamp(&mut self, timestamp: Timestamp) {
        assert!(
            self.in_unit_of_work(),
            "cannot set a prepare timestamp in state {}",
            self.state
        );
        assert!(
            self.prepare_timestamp.is_none(),
            "prepare timestamp already set to {:?} while setting it to {}",
            self.prepare_timestamp,
            timestamp
        );
        assert!(
            self.commit_timestamp.is_none(),
            "commit timestamp set to {:?} while setting prepare timestamp {}",
            self.commit_timestamp,
            timestamp
        );
        assert!(
            self.last_timestamp_set.is_none(),
            "unit-of-work timestamp set to {:?} while setting prepare timestamp {}",
            self.last_timestamp_set,
            timestamp
        );

        self.prepare_timestamp = Some(timestamp);
    }

    pub fn prepare_timestamp(&self) -> Timestamp {
        assert!(
            self.in_unit_of_work(),
            "cannot read the prepare timestamp in state {}",
            self.state
        );
        let prepare_timestamp = self.prepare_timestamp.expect("prepare timestamp not set");
        assert!(
            self.commit_timestamp.is_none(),
            "commit timestamp set to {:?} while reading the prepare timestamp",
            self.commit_timestamp
        );
        assert!(
            self.last_timestamp_set.is_none(),
            "unit-of-work timestamp set to {:?} while reading the prepare timestamp",
            self.last_timestamp_set
        );
        prepare_timestamp
    }

    /// Let reads on this recovery unit bypass conflicts with concurrently
    /// prepared but uncommitted transactions.
    pub fn set_ignore_prepared(&mut self, ignore: bool) {
        self.ignore_prepared = ignore;
    }

    /// Caller's promise that its writes commit in timestamp order. Reset to
    /// true at every transaction close.
    pub fn set_ordered_commit(&mut self, ordered: bool) {
        self.ordered_commit = ordered;
    }

    /// Pin untimestamped reads to the advancing oplog read frontier instead.
    pub fn set_oplog_reader(&mut self) {
        self.is_oplog_reader = true;
    }

    pub fn set_timestamp_read_source(&mut self, source: ReadSource, provided: Option<Timestamp>) {
        trace!(?source, ?provided, "setting timestamp read source");
        assert!(
            !self.is_active() || self.read_source == source,
            "cannot change the timestamp read source while a transaction is open: state {}",
            self.state
        );
        assert_eq!(
            provided.is_some(),
            source.requires_provided_timestamp(),
            "a timestamp must be provided exactly when the read source requires one"
        );
        assert!(
            provided != Some(TS_NONE),
            "cannot provide a null timestamp"
        );

        self.read_source = source;
        self.read_at_timestamp = provided;
    }

    pub fn timestamp_read_source(&self) -> ReadSource {
        self.read_source
    }

    /// Resolve and cache the majority-committed snapshot so a later
    /// transaction open can use it.
    pub fn obtain_majority_committed_snapshot(&mut self) -> Result<(), MarmotDBError> {
        assert_eq!(
            self.read_source,
            ReadSource::MajorityCommitted,
            "majority-committed snapshots require the MajorityCommitted read source"
        );
        let snapshot = self
            .session_cache
            .snapshot_manager()
            .committed_snapshot()
            .ok_or(MarmotDBError::ReadConcernMajorityNotAvailableYet)?;
        self.majority_committed_snapshot = Some(snapshot);
        Ok(())
    }

    /// The timestamp this recovery unit reads at, for read sources that pin
    /// one.
    pub fn point_in_time_read_timestamp(&self) -> Option<Timestamp> {
        match self.read_source {
            ReadSource::Provided
            | ReadSource::LastAppliedSnapshot
            | ReadSource::AllCommittedSnapshot => {
                Some(self.read_at_timestamp.expect("read timestamp not captured"))
            }
            ReadSource::LastApplied if self.read_at_timestamp.is_some() => self.read_at_timestamp,
            ReadSource::MajorityCommitted => Some(
                self.majority_committed_snapshot
                    .expect("majority-committed snapshot not resolved"),
            ),
            _ => None,
        }
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// Fast session statistics from the engine. Retrieval failures are
    /// reported inside the returned document rather than as an error.
    pub fn operation_statistics(&self) -> Document {
        let mut stats = Document::new();
        let Some(session) = self.session.as_ref() else {
            return stats;
        };
        match session.statistics() {
            Ok(doc) => stats = doc,
            Err(err) => {
                stats.insert(
                    "error".to_string(),
                    "unable to retrieve storage statistics".into(),
                );
                stats.insert("code".to_string(), i64::from(err.code()).into());
                stats.insert("reason".to_string(), err.to_string().into());
            }
        }
        stats
    }

    fn ensure_session(&mut self) {
        if self.session.is_none() {
            self.session = Some(TxnSession::new(self.session_cache.get_session()));
        }
    }

    fn commit_inner(&mut self) {
        // At most one of the commit timestamp and the unit-of-work timestamp
        // is ever populated, so the handler commit time is whichever is set.
        let commit_time = self.commit_timestamp.or(self.last_timestamp_set);

        let settled = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut notify_done = self.prepare_timestamp.is_some();
            if self.session.is_some() && self.is_active() {
                self.txn_close(true);
            }
            self.set_state(State::Committing);

            if ALWAYS_NOTIFY_PREPARE_CONFLICT_WAITERS.is_enabled() {
                notify_done = true;
            }
            if notify_done {
                self.session_cache
                    .notify_prepared_unit_of_work_has_committed_or_aborted();
            }

            for change in &mut self.changes {
                change.commit(commit_time);
            }
            self.changes.clear();
        }));
        if settled.is_err() {
            // The engine transaction is already committed; a failed handler
            // cannot be compensated.
            error!("a commit handler failed while settling; terminating");
            process::abort();
        }

        self.set_state(State::Inactive);
    }

    fn abort_inner(&mut self) {
        let settled = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut notify_done = self.prepare_timestamp.is_some();
            if self.session.is_some() && self.is_active() {
                self.txn_close(false);
            }
            self.set_state(State::Aborting);

            if ALWAYS_NOTIFY_PREPARE_CONFLICT_WAITERS.is_enabled() {
                notify_done = true;
            }
            if notify_done {
                self.session_cache
                    .notify_prepared_unit_of_work_has_committed_or_aborted();
            }

            for change in self.changes.iter_mut().rev() {
                change.rollback();
            }
            self.changes.clear();
        }));
        if settled.is_err() {
            error!("a rollback handler failed while settling; terminating");
            process::abort();
        }

        self.set_state(State::Inactive);
    }

    fn txn_open(&mut self) -> Result<(), MarmotDBError> {
        assert!(
            !self.is_active(),
            "transaction already open in state {}",
            self.state
        );
        assert!(
            !self.is_committing_or_aborting(),
            "commit or rollback handler reopened a transaction: {}",
            self.state
        );
        self.ensure_session();

        // Only pay for a timer when the slow-transaction log could fire.
        self.timer = tracing::enabled!(Level::DEBUG).then(Instant::now);

        match self.read_source {
            ReadSource::Unset | ReadSource::NoTimestamp => {
                let pinned = self
                    .is_oplog_reader
                    .then(|| self.oplog_manager.oplog_read_timestamp());
                let session = self.session.as_mut().expect("session present");
                let mut txn = session.begin_transaction(self.ignore_prepared);
                if let Some(read_timestamp) = pinned {
                    if let Err(err) = txn.set_timestamp(read_timestamp, RoundToOldest::Round) {
                        fatal_engine("could not pin the read to the oplog read timestamp", err);
                    }
                }
                txn.done();
            }
            ReadSource::MajorityCommitted => {
                let snapshot = self
                    .session_cache
                    .snapshot_manager()
                    .committed_snapshot()
                    .ok_or(MarmotDBError::ReadConcernMajorityNotAvailableYet)?;
                self.begin_at_snapshot(snapshot);
                // Record the read timestamp the transaction actually started
                // on, not merely the one resolved out of band.
                self.majority_committed_snapshot = Some(snapshot);
            }
            ReadSource::LastApplied => {
                match self.session_cache.snapshot_manager().local_snapshot() {
                    Some(local) => {
                        self.begin_at_snapshot(local);
                        self.read_at_timestamp = Some(local);
                    }
                    None => {
                        let session = self.session.as_mut().expect("session present");
                        session.begin_transaction(self.ignore_prepared).done();
                    }
                }
            }
            ReadSource::AllCommittedSnapshot => match self.read_at_timestamp {
                None => {
                    let actual = self.begin_at_all_committed();
                    self.read_at_timestamp = Some(actual);
                }
                // Reuse the captured timestamp for subsequent transactions.
                Some(read_timestamp) => self.begin_at_provided(read_timestamp)?,
            },
            ReadSource::LastAppliedSnapshot => match self.read_at_timestamp {
                None => {
                    // Capture the last applied timestamp once and keep
                    // reusing it until the read source changes.
                    let local = self
                        .session_cache
                        .snapshot_manager()
                        .local_snapshot()
                        .expect("last-applied snapshot reads require a local snapshot");
                    self.begin_at_snapshot(local);
                    self.read_at_timestamp = Some(local);
                }
                Some(read_timestamp) => self.begin_at_provided(read_timestamp)?,
            },
            ReadSource::Provided => {
                let read_timestamp = self
                    .read_at_timestamp
                    .expect("provided read source requires a timestamp");
                self.begin_at_provided(read_timestamp)?;
            }
        }

        trace!(snapshot_id = self.snapshot_id, "begin transaction");
        Ok(())
    }

    // Opens the transaction at a snapshot-manager-resolved timestamp; a
    // failure to pin such a timestamp is unrecoverable.
    fn begin_at_snapshot(&mut self, timestamp: Timestamp) {
        let ignore_prepared = self.ignore_prepared;
        let session = self.session.as_mut().expect("session present");
        let mut txn = session.begin_transaction(ignore_prepared);
        if let Err(err) = txn.set_timestamp(timestamp, RoundToOldest::NoRound) {
            fatal_engine("could not open a transaction at the resolved snapshot", err);
        }
        txn.done();
    }

    fn begin_at_all_committed(&mut self) -> Timestamp {
        let all_committed = self.oplog_manager.fetch_all_committed();
        let ignore_prepared = self.ignore_prepared;
        let session = self.session.as_mut().expect("session present");
        let mut txn = session.begin_transaction(ignore_prepared);
        if let Err(err) = txn.set_timestamp(all_committed, RoundToOldest::Round) {
            fatal_engine(
                "could not open a transaction at the all-committed timestamp",
                err,
            );
        }
        txn.done();
        // The fetch and the set are not in a critical section, so the engine
        // may have rounded to oldest in between. Read back the timestamp it
        // actually used.
        session.query_read_timestamp()
    }

    fn begin_at_provided(&mut self, timestamp: Timestamp) -> Result<(), MarmotDBError> {
        let ignore_prepared = self.ignore_prepared;
        let session = self.session.as_mut().expect("session present");
        let mut txn = session.begin_transaction(ignore_prepared);
        match txn.set_timestamp(timestamp, RoundToOldest::NoRound) {
            Ok(()) => {
                txn.done();
                Ok(())
            }
            Err(EngineError::InvalidArgument(_)) => Err(MarmotDBError::SnapshotTooOld(format!(
                "read timestamp {timestamp} is older than the oldest available timestamp"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn txn_close(&mut self, commit: bool) {
        assert!(
            self.is_active(),
            "cannot close a transaction in state {}",
            self.state
        );

        if let Some(started) = self.timer.take() {
            let elapsed_ms = started.elapsed().as_millis() as i64;
            if elapsed_ms >= slow_op_threshold_ms().max(1) {
                debug!(
                    snapshot_id = self.snapshot_id,
                    elapsed_ms, "slow transaction"
                );
            }
        }

        let session = self.session.as_mut().expect("session present");
        let commit_result = if commit {
            if let Some(commit_timestamp) = self.commit_timestamp {
                if let Err(err) = session.apply_commit_timestamp(commit_timestamp) {
                    fatal_engine("could not timestamp the transaction at commit", err);
                }
                self.is_timestamped = true;
            }
            let result = session.commit_transaction();
            trace!(snapshot_id = self.snapshot_id, "commit transaction");
            result
        } else {
            session.rollback_transaction();
            trace!(snapshot_id = self.snapshot_id, "rollback transaction");
            Ok(())
        };

        if self.is_timestamped {
            if !self.ordered_commit {
                // Oplog visibility only needs a push where commits can run
                // out of order with their assigned timestamps; such a commit
                // may otherwise become visible behind a skipped slot.
                self.oplog_manager.trigger_journal_flush();
            }
            self.is_timestamped = false;
        }
        if let Err(err) = commit_result {
            fatal_engine("could not commit the transaction", err);
        }

        assert!(
            self.last_timestamp_set.is_none() || self.commit_timestamp.is_none(),
            "cannot have both a unit-of-work timestamp {:?} and a commit timestamp {:?}",
            self.last_timestamp_set,
            self.commit_timestamp
        );

        // One transaction on a recovery unit may use set_timestamp while the
        // next uses set_commit_timestamp, so the unit-of-work timestamp
        // resets between transactions.
        self.last_timestamp_set = None;
        self.prepare_timestamp = None;
        self.snapshot_id = next_snapshot_id();
        self.is_oplog_reader = false;
        self.ordered_commit = true;
    }
}

impl fmt::Debug for RecoveryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryUnit")
            .field("state", &self.state)
            .field("snapshot_id", &self.snapshot_id)
            .field("read_source", &self.read_source)
            .field("changes", &self.changes.len())
            .finish()
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        if self.in_unit_of_work() {
            error!(state = %self.state, "recovery unit dropped inside a unit of work");
            process::abort();
        }
        self.abort_inner();
    }
}
