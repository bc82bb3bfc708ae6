//! In-memory blob store for tests and local development.
//!
//! All state lives behind one shared [`Arc`], so a process restart is
//! modeled by building a fresh [`MemoryRecovery`] view over the same store
//! while the "crashed" run's handles are simply never dropped.

use crate::blob::store::{
    BlobError, BlobObject, BlobRecovery, BlobStore, BlobTemporary, Content, ContentSize,
    RecoveredBlobTemporary,
};
use crate::types::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr, Xattr};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Shared byte buffer backing one object or temporary.
///
/// The buffer `Arc` is the content's identity: overwrites swap bytes inside
/// it, so every clone of the handle observes the current state.
#[derive(Clone, Default, Debug)]
pub struct MemoryContent {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryContent {
    fn replace_bytes(&self, data: &[u8]) {
        *self.bytes.lock() = data.to_vec();
    }

    fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn same_buffer(&self, other: &MemoryContent) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

#[async_trait]
impl Content for MemoryContent {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), BlobError> {
        let bytes = self.bytes.lock();
        let start = offset as usize;
        for (i, out) in buf.iter_mut().enumerate() {
            *out = bytes.get(start + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), BlobError> {
        let mut bytes = self.bytes.lock();
        let end = offset as usize + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn zero(&self, offset: u64, len: u64) -> Result<(), BlobError> {
        let mut bytes = self.bytes.lock();
        let start = (offset as usize).min(bytes.len());
        let end = ((offset + len) as usize).min(bytes.len());
        bytes[start..end].fill(0);
        Ok(())
    }

    async fn sync(&self) -> Result<(), BlobError> {
        Ok(())
    }

    fn start(&self) -> u64 {
        0
    }

    fn size(&self) -> ContentSize {
        ContentSize {
            end_marker: self.bytes.lock().len() as u64,
        }
    }
}

#[derive(Clone, Debug)]
struct ObjectRecord {
    xattr: Xattr,
    content: MemoryContent,
}

#[derive(Clone, Debug)]
struct TemporaryRecord {
    xattr: TemporaryXattr,
    content: MemoryContent,
}

#[derive(Default, Debug)]
struct StoreState {
    objects: Mutex<HashMap<ObjectId, ObjectRecord>>,
    temporaries: Mutex<BTreeMap<RecoveryId, TemporaryRecord>>,
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    state: Arc<StoreState>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a recovery view over this store's current state, as a fresh
    /// process would after a crash. Tagged temporaries move into the view;
    /// whatever the journaling layer does not reclaim is discarded at
    /// `finish`.
    pub fn recovery(&self) -> MemoryRecovery {
        let pending = std::mem::take(&mut *self.state.temporaries.lock());
        MemoryRecovery {
            state: self.state.clone(),
            pending,
        }
    }

    /// Ids of the tagged temporaries currently backing this store.
    pub fn temporary_ids(&self) -> Vec<RecoveryId> {
        self.state.temporaries.lock().keys().copied().collect()
    }

    pub fn contains_object(&self, id: ObjectId) -> bool {
        self.state.objects.lock().contains_key(&id)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    type Content = MemoryContent;
    type Object = MemoryObject;
    type Temporary = MemoryTemporary;
    type Recovered = MemoryRecoveredTemporary;

    async fn open_object(&self, id: ObjectId) -> Result<Option<MemoryObject>, BlobError> {
        let objects = self.state.objects.lock();
        Ok(objects.get(&id).map(|record| MemoryObject {
            state: self.state.clone(),
            id,
            content: record.content.clone(),
        }))
    }

    fn create_object(
        &self,
        id: ObjectId,
        xattr: Xattr,
        content: MemoryTemporary,
    ) -> Result<MemoryObject, BlobError> {
        let mut objects = self.state.objects.lock();
        if objects.contains_key(&id) {
            return Err(BlobError::AlreadyExists(id));
        }
        objects.insert(
            id,
            ObjectRecord {
                xattr,
                content: content.content.clone(),
            },
        );
        Ok(MemoryObject {
            state: self.state.clone(),
            id,
            content: content.content.clone(),
        })
    }

    fn new_temporary(&self) -> Result<MemoryTemporary, BlobError> {
        Ok(MemoryTemporary {
            state: self.state.clone(),
            content: MemoryContent::default(),
            meta: Mutex::new(TemporaryMeta {
                xattr: TemporaryXattr::default(),
                recovery_id: None,
            }),
        })
    }

    async fn sync(&self) -> Result<(), BlobError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryObject {
    state: Arc<StoreState>,
    id: ObjectId,
    content: MemoryContent,
}

impl BlobObject for MemoryObject {
    type Store = MemoryBlobStore;

    fn xattr(&self) -> Result<Xattr, BlobError> {
        let objects = self.state.objects.lock();
        objects
            .get(&self.id)
            .map(|record| record.xattr)
            .ok_or(BlobError::MissingObject(self.id))
    }

    fn set_xattr(&self, xattr: Xattr) -> Result<(), BlobError> {
        let mut objects = self.state.objects.lock();
        let record = objects
            .get_mut(&self.id)
            .ok_or(BlobError::MissingObject(self.id))?;
        record.xattr = xattr;
        Ok(())
    }

    fn overwrite(&self, xattr: Xattr, content: MemoryTemporary) -> Result<(), BlobError> {
        let data = content.content.snapshot();
        let mut objects = self.state.objects.lock();
        let record = objects
            .get_mut(&self.id)
            .ok_or(BlobError::MissingObject(self.id))?;
        record.xattr = xattr;
        record.content.replace_bytes(&data);
        Ok(())
    }

    fn remove(&self) -> Result<(), BlobError> {
        let mut objects = self.state.objects.lock();
        objects
            .remove(&self.id)
            .map(|_| ())
            .ok_or(BlobError::MissingObject(self.id))
    }

    fn content(&self) -> MemoryContent {
        self.content.clone()
    }
}

struct TemporaryMeta {
    xattr: TemporaryXattr,
    recovery_id: Option<RecoveryId>,
}

pub struct MemoryTemporary {
    state: Arc<StoreState>,
    content: MemoryContent,
    meta: Mutex<TemporaryMeta>,
}

impl MemoryTemporary {
    fn retag(&self, id: RecoveryId, xattr: Option<TemporaryXattr>) {
        let mut meta = self.meta.lock();
        if let Some(xattr) = xattr {
            meta.xattr = xattr;
        }
        let mut temporaries = self.state.temporaries.lock();
        if let Some(old) = meta.recovery_id.take() {
            temporaries.remove(&old);
        }
        temporaries.insert(
            id,
            TemporaryRecord {
                xattr: meta.xattr,
                content: self.content.clone(),
            },
        );
        meta.recovery_id = Some(id);
    }
}

impl BlobTemporary for MemoryTemporary {
    type Store = MemoryBlobStore;

    fn temporary_xattr(&self) -> Result<TemporaryXattr, BlobError> {
        Ok(self.meta.lock().xattr)
    }

    fn set_xattr(&self, xattr: TemporaryXattr) -> Result<(), BlobError> {
        let mut meta = self.meta.lock();
        meta.xattr = xattr;
        if let Some(id) = meta.recovery_id {
            if let Some(record) = self.state.temporaries.lock().get_mut(&id) {
                record.xattr = xattr;
            }
        }
        Ok(())
    }

    fn set_recovery_id(&self, id: RecoveryId) -> Result<(), BlobError> {
        self.retag(id, None);
        Ok(())
    }

    fn set_recovery_id_with_xattr(
        &self,
        id: RecoveryId,
        xattr: TemporaryXattr,
    ) -> Result<(), BlobError> {
        self.retag(id, Some(xattr));
        Ok(())
    }

    fn overwrite(&self, xattr: TemporaryXattr, content: MemoryTemporary) -> Result<(), BlobError> {
        let data = content.content.snapshot();
        self.content.replace_bytes(&data);
        self.set_xattr(xattr)
    }

    fn content(&self) -> MemoryContent {
        self.content.clone()
    }
}

impl Drop for MemoryTemporary {
    fn drop(&mut self) {
        // A tagged temporary is deleted with its handle; it only outlives
        // the process if the process died first. The buffer identity check
        // keeps a stale handle from deleting a successor under the same id.
        let meta = self.meta.get_mut();
        if let Some(id) = meta.recovery_id.take() {
            let mut temporaries = self.state.temporaries.lock();
            if let Some(record) = temporaries.get(&id) {
                if record.content.same_buffer(&self.content) {
                    temporaries.remove(&id);
                }
            }
        }
    }
}

pub struct MemoryRecoveredTemporary {
    state: Arc<StoreState>,
    old_id: RecoveryId,
    xattr: TemporaryXattr,
    content: MemoryContent,
}

impl RecoveredBlobTemporary for MemoryRecoveredTemporary {
    type Store = MemoryBlobStore;

    fn old_id(&self) -> RecoveryId {
        self.old_id
    }

    fn temporary_xattr(&self) -> Result<TemporaryXattr, BlobError> {
        Ok(self.xattr)
    }

    fn content(&self) -> MemoryContent {
        self.content.clone()
    }

    fn keep_as_object(self, id: ObjectId, xattr: Xattr) -> Result<MemoryObject, BlobError> {
        let mut objects = self.state.objects.lock();
        match objects.get_mut(&id) {
            Some(record) => {
                record.xattr = xattr;
                record.content.replace_bytes(&self.content.snapshot());
            }
            None => {
                objects.insert(
                    id,
                    ObjectRecord {
                        xattr,
                        content: self.content.clone(),
                    },
                );
            }
        }
        let content = objects.get(&id).map(|record| record.content.clone());
        Ok(MemoryObject {
            state: self.state.clone(),
            id,
            content: content.unwrap_or_else(|| self.content.clone()),
        })
    }

    fn keep_as_temporary(
        self,
        id: RecoveryId,
        xattr: TemporaryXattr,
    ) -> Result<MemoryTemporary, BlobError> {
        self.state.temporaries.lock().insert(
            id,
            TemporaryRecord {
                xattr,
                content: self.content.clone(),
            },
        );
        Ok(MemoryTemporary {
            state: self.state.clone(),
            content: self.content,
            meta: Mutex::new(TemporaryMeta {
                xattr,
                recovery_id: Some(id),
            }),
        })
    }
}

pub struct MemoryRecovery {
    state: Arc<StoreState>,
    pending: BTreeMap<RecoveryId, TemporaryRecord>,
}

impl BlobRecovery for MemoryRecovery {
    type Store = MemoryBlobStore;

    fn recover_temporaries(
        &mut self,
        ty: RecoveryType,
    ) -> Result<Vec<MemoryRecoveredTemporary>, BlobError> {
        let ids: Vec<RecoveryId> = self
            .pending
            .range(RecoveryId::new(ty, 0)..)
            .take_while(|(id, _)| id.ty == ty)
            .map(|(id, _)| *id)
            .collect();
        Ok(ids
            .into_iter()
            .map(|id| {
                let record = self.pending.remove(&id).expect("pending id just listed");
                MemoryRecoveredTemporary {
                    state: self.state.clone(),
                    old_id: id,
                    xattr: record.xattr,
                    content: record.content,
                }
            })
            .collect())
    }

    fn get_object(&mut self, id: ObjectId) -> Result<Option<MemoryObject>, BlobError> {
        let objects = self.state.objects.lock();
        Ok(objects.get(&id).map(|record| MemoryObject {
            state: self.state.clone(),
            id,
            content: record.content.clone(),
        }))
    }

    fn finish(self) -> MemoryBlobStore {
        // Whatever recovery did not reclaim is gone for good.
        drop(self.pending);
        MemoryBlobStore { state: self.state }
    }
}
