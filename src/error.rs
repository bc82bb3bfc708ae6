use crate::blob::BlobError;
use crate::types::{ObjectId, RecoveryId};
use thiserror::Error;

/// Errors surfaced by the journaling layer.
///
/// Lock conflicts are the only errors a caller is expected to handle by
/// retrying; everything that goes wrong after a transaction has reached the
/// journal is fatal and terminates the process instead of surfacing here.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Another transaction holds the object's exclusive lock.
    #[error("transaction aborted: object {0} is locked by another transaction")]
    ObjectLocked(ObjectId),

    /// Another transaction holds the temporary's exclusive lock.
    #[error("transaction aborted: temporary {0} is locked by another transaction")]
    TemporaryLocked(RecoveryId),

    #[error("invalid journal config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl JournalError {
    /// True for lock-conflict aborts, which callers resolve by retrying the
    /// whole transaction at a higher level.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            JournalError::ObjectLocked(_) | JournalError::TemporaryLocked(_)
        )
    }
}
