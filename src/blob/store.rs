use crate::types::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object {0} already exists")]
    AlreadyExists(ObjectId),
    #[error("object {0} is gone from the blob store")]
    MissingObject(ObjectId),
    #[error("{0}")]
    Backend(String),
}

/// End of the meaningful byte range held by a content handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentSize {
    pub end_marker: u64,
}

/// Handle to a mutable byte range held by the blob layer.
///
/// Handles are cheap clones of the same underlying range, and the range's
/// identity is stable across an in-place `overwrite` of its owner, so a
/// cached handle keeps observing the current bytes. Reads past the end
/// marker yield zeros.
#[async_trait]
pub trait Content: Clone + Send + Sync + 'static {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), BlobError>;
    fn write(&self, offset: u64, data: &[u8]) -> Result<(), BlobError>;

    /// Zero-fill `[offset, offset + len)`. Backends release backing blocks
    /// where they can; writing literal zeros is a valid implementation and
    /// only costs space, never correctness.
    fn zero(&self, offset: u64, len: u64) -> Result<(), BlobError>;

    /// Flush this range to durable media.
    async fn sync(&self) -> Result<(), BlobError>;

    /// First meaningful byte. Backends that reclaim zeroed prefixes may
    /// advance this; both shipped backends always report zero.
    fn start(&self) -> u64;

    fn size(&self) -> ContentSize;
}

/// A persistent object held open in the blob store.
pub trait BlobObject: Send + Sync + 'static {
    type Store: BlobStore;

    fn xattr(&self) -> Result<Xattr, BlobError>;
    fn set_xattr(&self, xattr: Xattr) -> Result<(), BlobError>;

    /// Replace xattr and content in one step, consuming the temporary that
    /// staged the new content.
    fn overwrite(
        &self,
        xattr: Xattr,
        content: <Self::Store as BlobStore>::Temporary,
    ) -> Result<(), BlobError>;

    fn remove(&self) -> Result<(), BlobError>;
    fn content(&self) -> <Self::Store as BlobStore>::Content;
}

/// An anonymous mutable file.
///
/// Dropping the handle deletes the backing file, tagged or not; a tagged
/// temporary outlives the process only when the process dies while the
/// handle is still alive, which is exactly what recovery enumerates.
pub trait BlobTemporary: Send + Sync + Sized + 'static {
    type Store: BlobStore;

    fn temporary_xattr(&self) -> Result<TemporaryXattr, BlobError>;
    fn set_xattr(&self, xattr: TemporaryXattr) -> Result<(), BlobError>;

    /// Tag the temporary so it can be found again after an unclean
    /// shutdown.
    fn set_recovery_id(&self, id: RecoveryId) -> Result<(), BlobError>;
    fn set_recovery_id_with_xattr(
        &self,
        id: RecoveryId,
        xattr: TemporaryXattr,
    ) -> Result<(), BlobError>;

    fn overwrite(
        &self,
        xattr: TemporaryXattr,
        content: <Self::Store as BlobStore>::Temporary,
    ) -> Result<(), BlobError>;

    fn content(&self) -> <Self::Store as BlobStore>::Content;
}

/// A temporary that survived an unclean shutdown, as surfaced by blob-layer
/// recovery. Consuming it either installs it somewhere permanent or, on
/// drop, deletes it.
pub trait RecoveredBlobTemporary: Send + Sized + 'static {
    type Store: BlobStore;

    fn old_id(&self) -> RecoveryId;
    fn temporary_xattr(&self) -> Result<TemporaryXattr, BlobError>;
    fn content(&self) -> <Self::Store as BlobStore>::Content;

    /// Install the surviving bytes as an object's content, replacing any
    /// current content for that id.
    fn keep_as_object(
        self,
        id: ObjectId,
        xattr: Xattr,
    ) -> Result<<Self::Store as BlobStore>::Object, BlobError>;

    /// Re-tag the survivor under a new recovery id.
    fn keep_as_temporary(
        self,
        id: RecoveryId,
        xattr: TemporaryXattr,
    ) -> Result<<Self::Store as BlobStore>::Temporary, BlobError>;
}

/// The blob store proper.
///
/// Implementations must satisfy:
/// - `open_object` returns `Ok(None)` for an unknown id; absence is not an
///   error.
/// - `create_object` fails with `AlreadyExists` rather than clobbering.
/// - Content handles honor the identity rules documented on [`Content`].
/// - All I/O errors are propagated, never silently ignored.
#[async_trait]
pub trait BlobStore: Send + Sync + Sized + 'static {
    type Content: Content;
    type Object: BlobObject<Store = Self>;
    type Temporary: BlobTemporary<Store = Self>;
    type Recovered: RecoveredBlobTemporary<Store = Self>;

    async fn open_object(&self, id: ObjectId) -> Result<Option<Self::Object>, BlobError>;

    fn create_object(
        &self,
        id: ObjectId,
        xattr: Xattr,
        content: Self::Temporary,
    ) -> Result<Self::Object, BlobError>;

    fn new_temporary(&self) -> Result<Self::Temporary, BlobError>;

    /// Flush every applied mutation to durable media.
    async fn sync(&self) -> Result<(), BlobError>;
}

/// Startup-time view of a blob store: surviving temporaries by type, plus
/// direct object access for replay. `finish` consumes the view and hands
/// back the live store.
pub trait BlobRecovery: Send + 'static {
    type Store: BlobStore;

    fn recover_temporaries(
        &mut self,
        ty: RecoveryType,
    ) -> Result<Vec<<Self::Store as BlobStore>::Recovered>, BlobError>;

    fn get_object(
        &mut self,
        id: ObjectId,
    ) -> Result<Option<<Self::Store as BlobStore>::Object>, BlobError>;

    fn finish(self) -> Self::Store;
}
