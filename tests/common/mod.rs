//! Scripted engine double shared by the integration suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use marmotdb::{
    Document, EngineError, EngineSession, OplogManager, RecoveryUnit, SessionCache,
    SnapshotManager, Timestamp,
};

#[derive(Default)]
pub struct MockState {
    pub ops: Mutex<Vec<String>>,
    pub oldest_timestamp: AtomicU64,
    pub committed_snapshot: Mutex<Option<Timestamp>>,
    pub local_snapshot: Mutex<Option<Timestamp>>,
    pub all_committed: AtomicU64,
    pub oplog_read_timestamp: AtomicU64,
    pub last_read_timestamp: AtomicU64,
    pub journal_flushes: AtomicU64,
    pub notifications: AtomicU64,
    pub durable_waits: Mutex<Vec<(bool, bool)>>,
    pub fail_statistics: AtomicBool,
}

impl MockState {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    fn push(&self, op: String) {
        self.ops.lock().push(op);
    }

    pub fn journal_flushes(&self) -> u64 {
        self.journal_flushes.load(Ordering::Relaxed)
    }

    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

pub struct MockEngineSession {
    state: Arc<MockState>,
}

impl EngineSession for MockEngineSession {
    fn begin_transaction(&mut self, config: &str) -> Result<(), EngineError> {
        self.state.push(format!("begin_transaction({config})"));
        Ok(())
    }

    fn timestamp_transaction(&mut self, config: &str) -> Result<(), EngineError> {
        if let Some(rest) = config.strip_prefix("read_timestamp=") {
            let hex = rest.split(',').next().unwrap_or("");
            let requested = Timestamp::from_str_radix(hex, 16)
                .map_err(|_| EngineError::InvalidArgument(format!("bad timestamp: {hex}")))?;
            let round = rest.contains("round_to_oldest=true");
            let oldest = self.state.oldest_timestamp.load(Ordering::Relaxed);
            let effective = if requested < oldest {
                if !round {
                    return Err(EngineError::InvalidArgument(format!(
                        "read timestamp {requested} older than oldest {oldest}"
                    )));
                }
                oldest
            } else {
                requested
            };
            self.state
                .last_read_timestamp
                .store(effective, Ordering::Relaxed);
        }
        self.state.push(format!("timestamp_transaction({config})"));
        Ok(())
    }

    fn prepare_transaction(&mut self, config: &str) -> Result<(), EngineError> {
        self.state.push(format!("prepare_transaction({config})"));
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), EngineError> {
        self.state.push("commit_transaction".into());
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), EngineError> {
        self.state.push("rollback_transaction".into());
        Ok(())
    }

    fn query_timestamp(&mut self, config: &str) -> Result<String, EngineError> {
        self.state.push(format!("query_timestamp({config})"));
        let read = self.state.last_read_timestamp.load(Ordering::Relaxed);
        Ok(format!("{read:x}\0"))
    }

    fn close_all_cursors(&mut self) {
        self.state.push("close_all_cursors".into());
    }

    fn set_drop_queued_idents_allowed(&mut self, allowed: bool) {
        self.state
            .push(format!("drop_queued_idents_allowed={allowed}"));
    }

    fn statistics(&self, uri: &str, config: &str) -> Result<Document, EngineError> {
        if self.state.fail_statistics.load(Ordering::Relaxed) {
            return Err(EngineError::Failed {
                code: -31802,
                message: "statistics unavailable".into(),
            });
        }
        let mut doc = Document::new();
        doc.insert("uri".to_string(), uri.into());
        doc.insert("config".to_string(), config.into());
        Ok(doc)
    }
}

pub struct MockHarness {
    state: Arc<MockState>,
}

impl SessionCache for MockHarness {
    fn get_session(&self) -> Box<dyn EngineSession> {
        Box::new(MockEngineSession {
            state: self.state.clone(),
        })
    }

    fn wait_until_durable(&self, force_checkpoint: bool, stable_checkpoint: bool) {
        self.state
            .durable_waits
            .lock()
            .push((force_checkpoint, stable_checkpoint));
    }

    fn notify_prepared_unit_of_work_has_committed_or_aborted(&self) {
        self.state.notifications.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_manager(&self) -> &dyn SnapshotManager {
        self
    }
}

impl OplogManager for MockHarness {
    fn oplog_read_timestamp(&self) -> Timestamp {
        self.state.oplog_read_timestamp.load(Ordering::Relaxed)
    }

    fn fetch_all_committed(&self) -> Timestamp {
        self.state.all_committed.load(Ordering::Relaxed)
    }

    fn trigger_journal_flush(&self) {
        self.state.journal_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

impl SnapshotManager for MockHarness {
    fn committed_snapshot(&self) -> Option<Timestamp> {
        *self.state.committed_snapshot.lock()
    }

    fn local_snapshot(&self) -> Option<Timestamp> {
        *self.state.local_snapshot.lock()
    }
}

pub fn harness() -> (Arc<MockHarness>, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    (
        Arc::new(MockHarness {
            state: state.clone(),
        }),
        state,
    )
}

pub fn recovery_unit(harness: &Arc<MockHarness>) -> RecoveryUnit {
    RecoveryUnit::new(harness.clone(), harness.clone())
}
