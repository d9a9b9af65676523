/// Which snapshot timestamp a newly opened transaction reads at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// No read source has been configured; reads open untimestamped.
    Unset,
    /// Read without a timestamp, seeing the newest committed data.
    NoTimestamp,
    /// Read at the majority-committed snapshot resolved by the snapshot
    /// manager.
    MajorityCommitted,
    /// Read at the latest locally applied snapshot when one exists, falling
    /// back to an untimestamped read.
    LastApplied,
    /// Read at the locally applied snapshot captured on first use, reusing
    /// that timestamp across reopens.
    LastAppliedSnapshot,
    /// Read at the engine's all-committed timestamp captured on first use,
    /// reusing that timestamp across reopens.
    AllCommittedSnapshot,
    /// Read at exactly the caller-provided timestamp.
    Provided,
}

impl ReadSource {
    /// Sources that must carry a caller-provided timestamp.
    pub fn requires_provided_timestamp(self) -> bool {
        matches!(self, ReadSource::Provided)
    }
}
