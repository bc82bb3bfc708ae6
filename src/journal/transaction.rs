//! Transactions: exclusive locks, pending shadows, and the commit pipeline.
//!
//! Wrapping an entity into a transaction takes its exclusive lock and hands
//! back a facade that accumulates pending changes without touching the blob
//! layer. `commit` turns the net effect of every locked handle into one
//! contiguous run of journal records, syncs them, and reports success; the
//! real mutations chase the sync through the layer's write queue.

use crate::blob::store::{BlobObject, BlobStore, BlobTemporary, Content};
use crate::error::JournalError;
use crate::journal::entry::{EntryTarget, EntryType, JournalEntry, JOURNAL_ENTRY_BYTES};
use crate::journal::layer::JournalLayer;
use crate::journal::object::{Object, RecoverableTemporary};
use crate::journal::queue::{fatal_protocol, ApplyBatch, ApplyFn};
use crate::types::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

struct PendingObject<B: BlobStore> {
    change_count: u64,
    created: bool,
    removed: bool,
    new_xattr: Option<Xattr>,
    new_content: Option<B::Temporary>,
}

/// Per-transaction shadow of one object. Constructing it takes the
/// object's exclusive lock; dropping it releases the lock.
pub(crate) struct LockedObject<B: BlobStore> {
    object: Arc<Object<B>>,
    pending: Mutex<PendingObject<B>>,
}

impl<B: BlobStore> LockedObject<B> {
    fn lock(object: Arc<Object<B>>) -> Result<Arc<Self>, JournalError> {
        if !object.try_acquire() {
            return Err(JournalError::ObjectLocked(object.id()));
        }
        Ok(Arc::new(Self {
            object,
            pending: Mutex::new(PendingObject {
                change_count: 0,
                created: false,
                removed: false,
                new_xattr: None,
                new_content: None,
            }),
        }))
    }

    /// Lock a freshly registered object together with its initial content.
    /// The creation itself counts as one change.
    fn lock_created(object: Arc<Object<B>>, content: B::Temporary) -> Arc<Self> {
        assert!(object.try_acquire(), "freshly created object cannot be locked");
        Arc::new(Self {
            object,
            pending: Mutex::new(PendingObject {
                change_count: 1,
                created: true,
                removed: false,
                new_xattr: None,
                new_content: Some(content),
            }),
        })
    }

    fn effective_xattr(&self, pending: &PendingObject<B>) -> Xattr {
        pending.new_xattr.unwrap_or_else(|| self.object.xattr())
    }

    /// Journal record for the net effect of this handle, staging any new
    /// content under the given id so recovery can find it.
    fn journal_entry(&self, staging_id: u64) -> Result<Option<JournalEntry>, JournalError> {
        let pending = self.pending.lock();
        if pending.change_count == 0 || (pending.created && pending.removed) {
            return Ok(None);
        }

        let mut entry_staging_id = 0;
        if let Some(content) = &pending.new_content {
            content.set_recovery_id(RecoveryId::new(RecoveryType::Staging, staging_id))?;
            entry_staging_id = staging_id;
        }

        let ty = if pending.created {
            EntryType::CreateObject
        } else if pending.removed {
            EntryType::DeleteObject
        } else if pending.new_content.is_none() {
            EntryType::UpdateXattr
        } else {
            EntryType::UpdateObject
        };

        Ok(Some(JournalEntry {
            ty,
            tx_size: 0,
            staging_id: entry_staging_id,
            target: EntryTarget::Object {
                id: self.object.id(),
                xattr: self.effective_xattr(&pending),
            },
        }))
    }

    /// Commit this handle: install the pending values as the object's
    /// cached state and return the deferred blob mutation. The closure owns
    /// everything it needs; no other method runs after this.
    fn take_apply(&self) -> ApplyFn<B> {
        let mut pending = self.pending.lock();
        if pending.change_count == 0 || (pending.created && pending.removed) {
            return Box::new(|_: &B| Ok(()));
        }

        let xattr = self.effective_xattr(&pending);
        let new_content = pending.new_content.take();
        self.object.update(
            xattr,
            new_content.as_ref().map(|content| content.content()),
            pending.change_count,
        );

        let object = self.object.clone();
        if pending.created {
            let content = new_content.expect("created object carries initial content");
            Box::new(move |blob: &B| {
                let inner = blob.create_object(object.id(), xattr, content)?;
                object.install_inner(inner);
                Ok(())
            })
        } else if pending.removed {
            Box::new(move |_: &B| object.with_inner(|inner| inner.remove()))
        } else if let Some(content) = new_content {
            Box::new(move |_: &B| object.with_inner(|inner| inner.overwrite(xattr, content)))
        } else {
            Box::new(move |_: &B| object.with_inner(|inner| inner.set_xattr(xattr)))
        }
    }
}

impl<B: BlobStore> Drop for LockedObject<B> {
    fn drop(&mut self) {
        self.object.release();
    }
}

struct PendingTemporary<B: BlobStore> {
    change_count: u64,
    created: bool,
    removed: bool,
    new_xattr: Option<TemporaryXattr>,
    new_content: Option<B::Temporary>,
}

/// Per-transaction shadow of one recoverable temporary.
pub(crate) struct LockedTemporary<B: BlobStore> {
    temporary: Arc<RecoverableTemporary<B>>,
    pending: Mutex<PendingTemporary<B>>,
}

impl<B: BlobStore> LockedTemporary<B> {
    fn lock(temporary: Arc<RecoverableTemporary<B>>) -> Result<Arc<Self>, JournalError> {
        if !temporary.try_acquire() {
            return Err(JournalError::TemporaryLocked(temporary.id()));
        }
        Ok(Arc::new(Self {
            temporary,
            pending: Mutex::new(PendingTemporary {
                change_count: 0,
                created: false,
                removed: false,
                new_xattr: None,
                new_content: None,
            }),
        }))
    }

    fn lock_created(temporary: Arc<RecoverableTemporary<B>>, content: B::Temporary) -> Arc<Self> {
        assert!(
            temporary.try_acquire(),
            "freshly created temporary cannot be locked"
        );
        Arc::new(Self {
            temporary,
            pending: Mutex::new(PendingTemporary {
                change_count: 1,
                created: true,
                removed: false,
                new_xattr: None,
                new_content: Some(content),
            }),
        })
    }

    fn mark_removed(&self) {
        let mut pending = self.pending.lock();
        pending.change_count += 1;
        pending.removed = true;
    }

    fn effective_xattr(&self, pending: &PendingTemporary<B>) -> TemporaryXattr {
        pending
            .new_xattr
            .unwrap_or_else(|| self.temporary.temporary_xattr())
    }

    fn journal_entry(&self, staging_id: u64) -> Result<Option<JournalEntry>, JournalError> {
        let pending = self.pending.lock();
        if pending.change_count == 0 || (pending.created && pending.removed) {
            return Ok(None);
        }

        let mut entry_staging_id = 0;
        if let Some(content) = &pending.new_content {
            content.set_recovery_id(RecoveryId::new(RecoveryType::Staging, staging_id))?;
            entry_staging_id = staging_id;
        }

        let ty = if pending.created {
            EntryType::CreateTemporary
        } else if pending.removed {
            EntryType::DeleteTemporary
        } else if pending.new_content.is_none() {
            EntryType::UpdateTemporaryXattr
        } else {
            EntryType::UpdateTemporary
        };

        Ok(Some(JournalEntry {
            ty,
            tx_size: 0,
            staging_id: entry_staging_id,
            target: EntryTarget::Temporary {
                id: self.temporary.id(),
                xattr: self.effective_xattr(&pending),
            },
        }))
    }

    fn take_apply(&self) -> ApplyFn<B> {
        let mut pending = self.pending.lock();
        if pending.change_count == 0 || (pending.created && pending.removed) {
            return Box::new(|_: &B| Ok(()));
        }

        let xattr = self.effective_xattr(&pending);
        let new_content = pending.new_content.take();
        self.temporary.update(
            xattr,
            new_content.as_ref().map(|content| content.content()),
            pending.change_count,
        );

        let temporary = self.temporary.clone();
        if pending.created {
            let content = new_content.expect("created temporary carries initial content");
            Box::new(move |_: &B| {
                content.set_recovery_id_with_xattr(temporary.id(), xattr)?;
                temporary.install_inner(content);
                Ok(())
            })
        } else if pending.removed {
            // Nothing to execute: releasing the handle frees the file.
            Box::new(move |_: &B| {
                drop(temporary);
                Ok(())
            })
        } else if let Some(content) = new_content {
            Box::new(move |_: &B| temporary.with_inner(|inner| inner.overwrite(xattr, content)))
        } else {
            Box::new(move |_: &B| temporary.with_inner(|inner| inner.set_xattr(xattr)))
        }
    }
}

impl<B: BlobStore> Drop for LockedTemporary<B> {
    fn drop(&mut self) {
        self.temporary.release();
    }
}

/// Caller-side facade over a locked object. Reads return the pending
/// shadow when present; mutations only accumulate until commit. Must not
/// be used after the owning transaction commits.
pub struct TxObject<B: BlobStore> {
    inner: Arc<LockedObject<B>>,
}

impl<B: BlobStore> std::fmt::Debug for TxObject<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxObject")
            .field("id", &self.inner.object.id())
            .finish()
    }
}

impl<B: BlobStore> TxObject<B> {
    /// The underlying open-object handle, which stays valid after the
    /// transaction commits.
    pub fn object(&self) -> Arc<Object<B>> {
        self.inner.object.clone()
    }

    pub fn xattr(&self) -> Xattr {
        let pending = self.inner.pending.lock();
        self.inner.effective_xattr(&pending)
    }

    pub fn set_xattr(&self, xattr: Xattr) {
        let mut pending = self.inner.pending.lock();
        pending.change_count += 1;
        pending.new_xattr = Some(xattr);
    }

    pub fn overwrite(&self, xattr: Xattr, content: B::Temporary) {
        let mut pending = self.inner.pending.lock();
        pending.change_count += 1;
        pending.new_xattr = Some(xattr);
        pending.new_content = Some(content);
    }

    pub fn remove(&self) {
        let mut pending = self.inner.pending.lock();
        pending.change_count += 1;
        pending.removed = true;
    }

    pub fn content(&self) -> B::Content {
        let pending = self.inner.pending.lock();
        match &pending.new_content {
            Some(content) => content.content(),
            None => self.inner.object.content(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.object.generation() + self.inner.pending.lock().change_count
    }
}

/// Caller-side facade over a locked recoverable temporary.
pub struct TxTemporary<B: BlobStore> {
    inner: Arc<LockedTemporary<B>>,
}

impl<B: BlobStore> TxTemporary<B> {
    /// The underlying recoverable-temporary handle, which stays valid after
    /// the transaction commits.
    pub fn temporary(&self) -> Arc<RecoverableTemporary<B>> {
        self.inner.temporary.clone()
    }

    pub fn temporary_xattr(&self) -> TemporaryXattr {
        let pending = self.inner.pending.lock();
        self.inner.effective_xattr(&pending)
    }

    pub fn set_xattr(&self, xattr: TemporaryXattr) {
        let mut pending = self.inner.pending.lock();
        pending.change_count += 1;
        pending.new_xattr = Some(xattr);
    }

    pub fn overwrite(&self, xattr: TemporaryXattr, content: B::Temporary) {
        let mut pending = self.inner.pending.lock();
        pending.change_count += 1;
        pending.new_xattr = Some(xattr);
        pending.new_content = Some(content);
    }

    pub fn remove(&self) {
        self.inner.mark_removed();
    }

    pub fn content(&self) -> B::Content {
        let pending = self.inner.pending.lock();
        match &pending.new_content {
            Some(content) => content.content(),
            None => self.inner.temporary.content(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.temporary.generation() + self.inner.pending.lock().change_count
    }
}

/// Builder for one atomic group of mutations.
///
/// Locks are taken eagerly at wrap/create time; a conflict aborts the
/// wrap, and dropping the transaction without committing releases every
/// lock with the system unchanged.
pub struct Transaction<B: BlobStore> {
    layer: Arc<JournalLayer<B>>,
    objects: Vec<Arc<LockedObject<B>>>,
    temporaries: Vec<Arc<LockedTemporary<B>>>,
}

impl<B: BlobStore> Transaction<B> {
    pub(crate) fn new(layer: Arc<JournalLayer<B>>) -> Self {
        Self {
            layer,
            objects: Vec::new(),
            temporaries: Vec::new(),
        }
    }

    /// Take the object's exclusive lock and include it in this transaction.
    pub fn wrap_object(&mut self, object: &Arc<Object<B>>) -> Result<TxObject<B>, JournalError> {
        let locked = LockedObject::lock(object.clone())?;
        self.objects.push(locked.clone());
        Ok(TxObject { inner: locked })
    }

    pub fn wrap_temporary(
        &mut self,
        temporary: &Arc<RecoverableTemporary<B>>,
    ) -> Result<TxTemporary<B>, JournalError> {
        let locked = LockedTemporary::lock(temporary.clone())?;
        self.temporaries.push(locked.clone());
        Ok(TxTemporary { inner: locked })
    }

    /// Register a brand-new object whose initial content is the given
    /// temporary. The underlying handle (see [`TxObject::object`]) reads the
    /// staged state immediately; the blob-layer object materializes when
    /// this transaction is applied.
    pub fn create_object(
        &mut self,
        id: ObjectId,
        xattr: Xattr,
        content: B::Temporary,
    ) -> TxObject<B> {
        let object = Object::staged(self.layer.registry(), id, xattr, content.content());
        let locked = LockedObject::lock_created(object, content);
        self.objects.push(locked.clone());
        TxObject { inner: locked }
    }

    pub fn create_recoverable_temporary(
        &mut self,
        id: RecoveryId,
        xattr: TemporaryXattr,
        content: B::Temporary,
    ) -> TxTemporary<B> {
        let temporary = RecoverableTemporary::staged(id, xattr, content.content());
        let locked = LockedTemporary::lock_created(temporary, content);
        self.temporaries.push(locked.clone());
        TxTemporary { inner: locked }
    }

    /// Commit the transaction. The future resolves once the journal record
    /// is durable; the blob-layer apply follows asynchronously in commit
    /// order. Once the build phase starts, every failure is fatal to the
    /// process, which relies on recovery at the next start.
    pub async fn commit(self) -> Result<(), JournalError> {
        self.commit_inner(None).await
    }

    /// Commit while atomically consuming a previously persisted recoverable
    /// temporary. Wrapping the consumed temporary takes its exclusive lock
    /// like any other wrap, so a conflict aborts the transaction and is
    /// returned for the caller to retry; nothing has reached the journal at
    /// that point.
    pub async fn commit_consuming(
        self,
        temporary: Arc<RecoverableTemporary<B>>,
    ) -> Result<(), JournalError> {
        self.commit_inner(Some(temporary)).await
    }

    async fn commit_inner(
        mut self,
        consume: Option<Arc<RecoverableTemporary<B>>>,
    ) -> Result<(), JournalError> {
        if let Some(temporary) = consume {
            let locked = LockedTemporary::lock(temporary)?;
            locked.mark_removed();
            self.temporaries.push(locked);
        }

        let (synced, journal_content) = match self.stage() {
            Ok(parts) => parts,
            Err(err) => fatal_protocol("stage transaction", &err),
        };

        if let Err(err) = journal_content.sync().await {
            fatal_protocol("sync journal", &err);
        }

        // Durable: unblock the apply pipeline and report success.
        let _ = synced.send(());
        Ok(())
    }

    /// Build phase. Runs without suspension under the layer mutex, so the
    /// journal write offset and the queue position agree across concurrent
    /// commits.
    fn stage(&mut self) -> Result<(oneshot::Sender<()>, B::Content), JournalError> {
        let capacity = self.objects.len() + self.temporaries.len();
        let mut entries: Vec<JournalEntry> = Vec::with_capacity(capacity);
        let mut applies: Vec<ApplyFn<B>> = Vec::with_capacity(capacity);

        let layer = self.layer.clone();
        let mut shared = layer.shared().lock();

        for locked in &self.objects {
            let staging_id = shared.alloc_staging_id();
            if let Some(entry) = locked.journal_entry(staging_id)? {
                entries.push(entry);
            }
            applies.push(locked.take_apply());
        }
        for locked in &self.temporaries {
            let staging_id = shared.alloc_staging_id();
            if let Some(entry) = locked.journal_entry(staging_id)? {
                entries.push(entry);
            }
            applies.push(locked.take_apply());
        }

        let total = entries.len() as u32;
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.tx_size = total - i as u32;
        }

        let mut record_bytes = Vec::with_capacity(entries.len() * JOURNAL_ENTRY_BYTES);
        for entry in &entries {
            record_bytes.extend_from_slice(&entry.encode());
        }

        let journal_content = shared.journal_content();
        let old_pos = shared.journal_position;
        if !record_bytes.is_empty() {
            journal_content.write(old_pos, &record_bytes)?;
        }
        let new_pos = old_pos + record_bytes.len() as u64;
        shared.journal_position = new_pos;

        let (synced, synced_rx) = oneshot::channel();
        shared.queue().enqueue(ApplyBatch {
            applies,
            old_pos,
            new_pos,
            synced: synced_rx,
        });

        Ok((synced, journal_content))
    }
}
