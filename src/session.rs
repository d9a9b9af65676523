use tracing::error;

use crate::engine::{fatal_engine, EngineError, EngineSession};
use crate::txn::Timestamp;
use crate::Document;

/// Rounding behavior when pinning a read timestamp that may be older than the
/// engine's oldest available timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundToOldest {
    Round,
    NoRound,
}

/// Adapter over a pooled engine session.
///
/// Encodes timestamps into the engine's configuration-string wire format and
/// translates engine failures: recoverable ones surface as [`EngineError`],
/// while commit/rollback/prepare failures terminate the process, since the
/// engine transaction's fate is already decided at that point.
pub struct TxnSession {
    inner: Box<dyn EngineSession>,
}

impl std::fmt::Debug for TxnSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnSession").finish_non_exhaustive()
    }
}

impl TxnSession {
    pub(crate) fn new(inner: Box<dyn EngineSession>) -> Self {
        Self { inner }
    }

    /// Raw engine access for cursor and data operations.
    pub fn engine_session(&mut self) -> &mut dyn EngineSession {
        self.inner.as_mut()
    }

    pub(crate) fn begin_transaction(&mut self, ignore_prepared: bool) -> BeginTxnBlock<'_> {
        BeginTxnBlock::new(self.inner.as_mut(), ignore_prepared)
    }

    pub(crate) fn apply_commit_timestamp(
        &mut self,
        timestamp: Timestamp,
    ) -> Result<(), EngineError> {
        self.inner
            .timestamp_transaction(&format!("commit_timestamp={timestamp:x}"))
    }

    pub(crate) fn commit_transaction(&mut self) -> Result<(), EngineError> {
        self.inner.commit_transaction()
    }

    pub(crate) fn rollback_transaction(&mut self) {
        if let Err(err) = self.inner.rollback_transaction() {
            fatal_engine("could not roll back the transaction", err);
        }
    }

    pub(crate) fn prepare_transaction(&mut self, prepare_timestamp: Timestamp) {
        let config = format!("prepare_timestamp={prepare_timestamp:x}");
        if let Err(err) = self.inner.prepare_transaction(&config) {
            fatal_engine("could not prepare the transaction", err);
        }
    }

    /// The read timestamp the engine actually used for the open transaction.
    /// This may differ from the requested timestamp when the engine rounded.
    pub(crate) fn query_read_timestamp(&mut self) -> Timestamp {
        let raw = match self.inner.query_timestamp("get=read") {
            Ok(raw) => raw,
            Err(err) => fatal_engine("could not query the transaction read timestamp", err),
        };
        match parse_read_timestamp(&raw) {
            Some(timestamp) => timestamp,
            None => {
                error!(%raw, "engine returned an unparseable read timestamp");
                std::process::abort()
            }
        }
    }

    pub fn close_all_cursors(&mut self) {
        self.inner.close_all_cursors();
    }

    pub fn set_drop_queued_idents_allowed(&mut self, allowed: bool) {
        self.inner.set_drop_queued_idents_allowed(allowed);
    }

    pub(crate) fn statistics(&self) -> Result<Document, EngineError> {
        self.inner.statistics("statistics:session", "statistics=(fast)")
    }
}

/// An engine transaction that has been begun but not yet handed over.
///
/// The transaction may be refined with [`BeginTxnBlock::set_timestamp`]
/// before [`BeginTxnBlock::done`] marks it usable. Dropping the block first
/// rolls the transaction back, so a failed timestamped open never leaks an
/// open engine transaction.
pub struct BeginTxnBlock<'a> {
    session: &'a mut dyn EngineSession,
    done: bool,
}

impl<'a> BeginTxnBlock<'a> {
    fn new(session: &'a mut dyn EngineSession, ignore_prepared: bool) -> Self {
        let config = if ignore_prepared {
            "ignore_prepare=true"
        } else {
            ""
        };
        if let Err(err) = session.begin_transaction(config) {
            fatal_engine("could not begin a transaction", err);
        }
        Self {
            session,
            done: false,
        }
    }

    /// Pin the transaction's read timestamp.
    pub fn set_timestamp(
        &mut self,
        timestamp: Timestamp,
        round: RoundToOldest,
    ) -> Result<(), EngineError> {
        let config = match round {
            RoundToOldest::Round => format!("read_timestamp={timestamp:x},round_to_oldest=true"),
            RoundToOldest::NoRound => format!("read_timestamp={timestamp:x}"),
        };
        self.session.timestamp_transaction(&config)
    }

    /// Mark the transaction usable; it now belongs to the session.
    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for BeginTxnBlock<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(err) = self.session.rollback_transaction() {
            fatal_engine("could not roll back an abandoned transaction", err);
        }
    }
}

fn parse_read_timestamp(raw: &str) -> Option<Timestamp> {
    let hex = raw.trim_end_matches('\0');
    if hex.is_empty() || hex.len() > 16 {
        return None;
    }
    Timestamp::from_str_radix(hex, 16).ok()
}
