//! `strata` is a journaling layer that sits atop a blob store and turns a
//! collection of independent object mutations into atomic, crash-consistent
//! transactions.
//!
//! The crate is intentionally opinionated about the durability order:
//! - A transaction is durable the moment its journal record is synced; the
//!   underlying blob mutations are applied lazily, in commit order.
//! - Recovery replays the journal idempotently, so a crash at any point
//!   converges to the same state.
//! - Failures past the journal sync are fail-stop: the process aborts and
//!   recovery reconciles at the next start.
//!
//! A fresh or crashed store always starts through [`JournalRecovery`],
//! which replays whatever survived and hands back a live [`JournalLayer`].

#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod blob;
pub mod config;
pub mod error;
pub mod journal;
pub mod types;

pub use blob::{
    BlobError, BlobObject, BlobRecovery, BlobStore, BlobTemporary, Content, ContentSize,
    LocalFsRecovery, LocalFsStore, MemoryBlobStore, MemoryRecovery, RecoveredBlobTemporary,
};
pub use config::JournalConfig;
pub use error::JournalError;
pub use journal::{
    EntryCodecError, EntryTarget, EntryType, JournalEntry, JournalLayer, JournalRecovery, Object,
    RecoverableTemporary, RecoveredTemporary, Transaction, TxObject, TxTemporary,
    JOURNAL_ENTRY_BYTES,
};
pub use types::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr};
