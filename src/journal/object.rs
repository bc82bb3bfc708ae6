//! Open entities: journaled objects and recoverable temporaries.
//!
//! Both cache the xattr and, once a transaction has committed against them,
//! the staged content, so readers observe committed state immediately even
//! while the blob-layer apply is still queued behind the journal sync. The
//! `generation` counter advances by the committing transaction's change
//! count at that same moment.

use crate::blob::store::{BlobError, BlobObject, BlobStore, BlobTemporary};
use crate::journal::registry::Registry;
use crate::types::{ObjectId, RecoveryId, TemporaryXattr, Xattr};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct ObjectState<B: BlobStore> {
    /// Blob-layer object, absent until a pending create has been applied.
    inner: Option<B::Object>,
    cached_xattr: Xattr,
    cached_content: Option<B::Content>,
    generation: u64,
}

/// An open persistent object. Identity is the [`ObjectId`]; the registry
/// guarantees at most one live handle per id.
pub struct Object<B: BlobStore> {
    registry: Arc<Registry<B>>,
    id: ObjectId,
    locked: AtomicBool,
    state: Mutex<ObjectState<B>>,
}

impl<B: BlobStore> Object<B> {
    /// Wrap a blob-layer object fetched from the store and register the
    /// handle.
    pub(crate) fn from_inner(
        registry: Arc<Registry<B>>,
        id: ObjectId,
        inner: B::Object,
    ) -> Result<Arc<Self>, BlobError> {
        let cached_xattr = inner.xattr()?;
        let object = Arc::new(Self {
            registry: registry.clone(),
            id,
            locked: AtomicBool::new(false),
            state: Mutex::new(ObjectState {
                inner: Some(inner),
                cached_xattr,
                cached_content: None,
                generation: 0,
            }),
        });
        registry.insert(id, &object);
        Ok(object)
    }

    /// Register a brand-new object whose content is still staged; the inner
    /// blob object arrives when the creating transaction is applied.
    pub(crate) fn staged(
        registry: Arc<Registry<B>>,
        id: ObjectId,
        xattr: Xattr,
        content: B::Content,
    ) -> Arc<Self> {
        let object = Arc::new(Self {
            registry: registry.clone(),
            id,
            locked: AtomicBool::new(false),
            state: Mutex::new(ObjectState {
                inner: None,
                cached_xattr: xattr,
                cached_content: Some(content),
                generation: 0,
            }),
        });
        registry.insert(id, &object);
        object
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn xattr(&self) -> Xattr {
        self.state.lock().cached_xattr
    }

    pub fn content(&self) -> B::Content {
        let state = self.state.lock();
        match &state.cached_content {
            Some(content) => content.clone(),
            None => state
                .inner
                .as_ref()
                .expect("an open object has either cached or inner content")
                .content(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Commit-path transition: install what getters should return from now
    /// on, possibly before the journaled mutation reaches the blob layer.
    pub(crate) fn update(&self, xattr: Xattr, content: Option<B::Content>, change_count: u64) {
        let mut state = self.state.lock();
        state.generation += change_count;
        state.cached_xattr = xattr;
        if let Some(content) = content {
            state.cached_content = Some(content);
        }
    }

    pub(crate) fn install_inner(&self, inner: B::Object) {
        self.state.lock().inner = Some(inner);
    }

    pub(crate) fn with_inner<T>(
        &self,
        op: impl FnOnce(&B::Object) -> Result<T, BlobError>,
    ) -> Result<T, BlobError> {
        let state = self.state.lock();
        let inner = state.inner.as_ref().ok_or_else(|| {
            BlobError::Backend(format!("object {} has no applied backing object", self.id))
        })?;
        op(inner)
    }

    pub(crate) fn try_acquire(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    pub(crate) fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl<B: BlobStore> Drop for Object<B> {
    fn drop(&mut self) {
        self.registry.remove_dead(self.id);
    }
}

struct TemporaryState<B: BlobStore> {
    inner: Option<B::Temporary>,
    cached_xattr: TemporaryXattr,
    cached_content: Option<B::Content>,
    generation: u64,
}

/// An open recoverable temporary. Keyed by [`RecoveryId`] and not part of
/// the object registry; it survives a crash only if its recovery type is a
/// caller-owned category.
pub struct RecoverableTemporary<B: BlobStore> {
    id: RecoveryId,
    locked: AtomicBool,
    state: Mutex<TemporaryState<B>>,
}

impl<B: BlobStore> RecoverableTemporary<B> {
    /// Wrap a blob-layer temporary that already carries this identity,
    /// e.g. one reclaimed through recovery.
    pub(crate) fn adopted(
        id: RecoveryId,
        xattr: TemporaryXattr,
        inner: B::Temporary,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            locked: AtomicBool::new(false),
            state: Mutex::new(TemporaryState {
                inner: Some(inner),
                cached_xattr: xattr,
                cached_content: None,
                generation: 0,
            }),
        })
    }

    /// A brand-new recoverable temporary whose content is still staged.
    pub(crate) fn staged(id: RecoveryId, xattr: TemporaryXattr, content: B::Content) -> Arc<Self> {
        Arc::new(Self {
            id,
            locked: AtomicBool::new(false),
            state: Mutex::new(TemporaryState {
                inner: None,
                cached_xattr: xattr,
                cached_content: Some(content),
                generation: 0,
            }),
        })
    }

    pub fn id(&self) -> RecoveryId {
        self.id
    }

    pub fn temporary_xattr(&self) -> TemporaryXattr {
        self.state.lock().cached_xattr
    }

    pub fn content(&self) -> B::Content {
        let state = self.state.lock();
        match &state.cached_content {
            Some(content) => content.clone(),
            None => state
                .inner
                .as_ref()
                .expect("an open temporary has either cached or inner content")
                .content(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub(crate) fn update(
        &self,
        xattr: TemporaryXattr,
        content: Option<B::Content>,
        change_count: u64,
    ) {
        let mut state = self.state.lock();
        state.generation += change_count;
        state.cached_xattr = xattr;
        if let Some(content) = content {
            state.cached_content = Some(content);
        }
    }

    pub(crate) fn install_inner(&self, inner: B::Temporary) {
        self.state.lock().inner = Some(inner);
    }

    pub(crate) fn with_inner<T>(
        &self,
        op: impl FnOnce(&B::Temporary) -> Result<T, BlobError>,
    ) -> Result<T, BlobError> {
        let state = self.state.lock();
        let inner = state.inner.as_ref().ok_or_else(|| {
            BlobError::Backend(format!(
                "temporary {} has no applied backing file",
                self.id
            ))
        })?;
        op(inner)
    }

    pub(crate) fn try_acquire(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    pub(crate) fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}
