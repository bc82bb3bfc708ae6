//! Journaling core: record codec, open-handle registry, transactions, the
//! ordered apply queue, and crash recovery.

pub mod entry;
pub mod layer;
pub mod object;
pub(crate) mod queue;
pub mod recovery;
pub(crate) mod registry;
pub mod transaction;

pub use entry::{EntryCodecError, EntryTarget, EntryType, JournalEntry, JOURNAL_ENTRY_BYTES};
pub use layer::JournalLayer;
pub use object::{Object, RecoverableTemporary};
pub use recovery::{JournalRecovery, RecoveredTemporary};
pub use transaction::{Transaction, TxObject, TxTemporary};
