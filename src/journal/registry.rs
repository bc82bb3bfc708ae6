use crate::blob::BlobStore;
use crate::journal::object::Object;
use crate::types::ObjectId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Process-wide map of open object handles.
///
/// At most one live handle exists per object id; lookups return the
/// registered one. A caller asking for a second independent handle while
/// one is still alive is a programming error and trips the insert
/// assertion.
pub(crate) struct Registry<B: BlobStore> {
    open: Mutex<HashMap<ObjectId, Weak<Object<B>>>>,
}

impl<B: BlobStore> Registry<B> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn lookup(&self, id: ObjectId) -> Option<Arc<Object<B>>> {
        self.open.lock().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn insert(&self, id: ObjectId, object: &Arc<Object<B>>) {
        let mut open = self.open.lock();
        if let Some(existing) = open.get(&id) {
            assert!(
                existing.upgrade().is_none(),
                "object {id} is already open; drop the existing handle first"
            );
        }
        open.insert(id, Arc::downgrade(object));
    }

    /// Drops the id's entry only when the registered handle is dead, so a
    /// lagging destructor never evicts a successor registered under the
    /// same id.
    pub(crate) fn remove_dead(&self, id: ObjectId) {
        let mut open = self.open.lock();
        if let Some(existing) = open.get(&id) {
            if existing.upgrade().is_none() {
                open.remove(&id);
            }
        }
    }
}
