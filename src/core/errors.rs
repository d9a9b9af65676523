use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum MarmotDBError {
    #[error("bad value: {0}")]
    BadValue(String),

    #[error("read concern majority reads are currently not possible")]
    ReadConcernMajorityNotAvailableYet,

    #[error("snapshot too old: {0}")]
    SnapshotTooOld(String),

    #[error("storage engine error: {0}")]
    StorageEngine(#[source] EngineError),
}

impl From<EngineError> for MarmotDBError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidArgument(message) => MarmotDBError::BadValue(message),
            other => MarmotDBError::StorageEngine(other),
        }
    }
}
