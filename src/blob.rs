//! Blob-layer seam: the storage contract the journaling layer consumes, plus
//! the backends that ship with the crate.

pub mod localfs;
pub mod memory;
pub mod store;

pub use localfs::{
    FileContent, LocalFsObject, LocalFsRecovery, LocalFsRecoveredTemporary, LocalFsStore,
    LocalFsTemporary,
};
pub use memory::{
    MemoryBlobStore, MemoryContent, MemoryObject, MemoryRecoveredTemporary, MemoryRecovery,
    MemoryTemporary,
};
pub use store::{
    BlobError, BlobObject, BlobRecovery, BlobStore, BlobTemporary, Content, ContentSize,
    RecoveredBlobTemporary,
};
