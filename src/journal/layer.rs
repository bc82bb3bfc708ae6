//! The top-level journaling layer object.

use crate::blob::store::{BlobStore, BlobTemporary};
use crate::config::JournalConfig;
use crate::error::JournalError;
use crate::journal::object::Object;
use crate::journal::queue::WriteQueue;
use crate::journal::registry::Registry;
use crate::journal::transaction::Transaction;
use crate::types::ObjectId;
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct LayerShared<B: BlobStore> {
    journal_file: B::Temporary,
    pub(crate) journal_position: u64,
    staging_counter: u64,
    queue: WriteQueue<B>,
}

impl<B: BlobStore> LayerShared<B> {
    pub(crate) fn alloc_staging_id(&mut self) -> u64 {
        let id = self.staging_counter;
        self.staging_counter += 1;
        id
    }

    pub(crate) fn journal_content(&self) -> B::Content {
        self.journal_file.content()
    }

    pub(crate) fn queue(&self) -> &WriteQueue<B> {
        &self.queue
    }
}

/// A live journaling layer.
///
/// Owns the blob store, the journal file and its write offset, the staging
/// id counter, the open-object registry, and the write queue. Constructed
/// exclusively through [`crate::journal::recovery::JournalRecovery::finish`],
/// which is also where an empty store gets its first journal file.
pub struct JournalLayer<B: BlobStore> {
    blob: Arc<B>,
    registry: Arc<Registry<B>>,
    config: JournalConfig,
    shared: Mutex<LayerShared<B>>,
}

impl<B: BlobStore> JournalLayer<B> {
    pub(crate) fn start(
        blob: Arc<B>,
        registry: Arc<Registry<B>>,
        config: JournalConfig,
        journal_file: B::Temporary,
    ) -> Arc<Self> {
        let queue = WriteQueue::start(blob.clone(), journal_file.content(), config.block_size);
        Arc::new(Self {
            blob,
            registry,
            config,
            shared: Mutex::new(LayerShared {
                journal_file,
                journal_position: 0,
                staging_counter: 0,
                queue,
            }),
        })
    }

    /// Open an object, returning the already-open handle when one is
    /// registered (possibly held alive only by an in-flight transaction),
    /// else fetching from the blob store. Absence is not an error.
    pub async fn open_object(&self, id: ObjectId) -> Result<Option<Arc<Object<B>>>, JournalError> {
        if let Some(object) = self.registry.lookup(id) {
            return Ok(Some(object));
        }
        match self.blob.open_object(id).await? {
            Some(inner) => Ok(Some(Object::from_inner(self.registry.clone(), id, inner)?)),
            None => Ok(None),
        }
    }

    /// A plain blob temporary, not yet part of any transaction. Used to
    /// build content that a later transaction stages.
    pub fn new_detached_temporary(&self) -> Result<B::Temporary, JournalError> {
        Ok(self.blob.new_temporary()?)
    }

    pub fn begin_transaction(self: &Arc<Self>) -> Transaction<B> {
        Transaction::new(self.clone())
    }

    /// Resolves once every transaction committed before the call has been
    /// applied to the blob store. Useful for orderly shutdown.
    pub async fn quiesce(&self) {
        let queue = self.shared.lock().queue().clone();
        queue.quiesce().await;
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> Arc<Registry<B>> {
        self.registry.clone()
    }

    pub(crate) fn shared(&self) -> &Mutex<LayerShared<B>> {
        &self.shared
    }
}
