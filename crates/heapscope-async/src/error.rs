use std::fmt;

use heapscope_snapshot::SnapshotError;

#[derive(Debug)]
pub enum DumpAsyncError {
    /// The snapshot could not be walked at all.
    Snapshot(SnapshotError),
    /// The caller cancelled the run.
    Cancelled,
}

impl fmt::Display for DumpAsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot(err) => write!(f, "{err}"),
            Self::Cancelled => write!(f, "analysis cancelled"),
        }
    }
}

impl std::error::Error for DumpAsyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Snapshot(err) => Some(err),
            Self::Cancelled => None,
        }
    }
}

impl From<SnapshotError> for DumpAsyncError {
    fn from(value: SnapshotError) -> Self {
        Self::Snapshot(value)
    }
}
