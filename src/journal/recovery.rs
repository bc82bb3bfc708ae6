//! Crash recovery: replay the surviving journal against the blob store and
//! hand back a live layer.
//!
//! Every replay step tolerates missing staging files and missing targets;
//! that is how a run that crashed mid-apply reconciles against the journal
//! being replayed a second time. Repeating the whole algorithm is likewise
//! harmless.

use crate::blob::store::{
    BlobObject, BlobRecovery, BlobStore, BlobTemporary, Content, RecoveredBlobTemporary,
};
use crate::config::JournalConfig;
use crate::error::JournalError;
use crate::journal::entry::{EntryTarget, EntryType, JournalEntry, JOURNAL_ENTRY_BYTES};
use crate::journal::layer::JournalLayer;
use crate::journal::object::{Object, RecoverableTemporary};
use crate::journal::registry::Registry;
use crate::types::{ObjectId, RecoveryId, RecoveryType, TemporaryXattr};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A caller-owned temporary that survived the crash. Extracted from
/// recovery by type; `keep_as` re-registers it in the new layer, and an
/// unextracted survivor is discarded at `finish`.
pub struct RecoveredTemporary<B: BlobStore> {
    old_id: RecoveryId,
    xattr: TemporaryXattr,
    inner: B::Recovered,
}

impl<B: BlobStore> RecoveredTemporary<B> {
    fn from_survivor(inner: B::Recovered) -> Result<Self, JournalError> {
        let old_id = inner.old_id();
        let xattr = inner.temporary_xattr()?;
        Ok(Self {
            old_id,
            xattr,
            inner,
        })
    }

    fn adopted(old_id: RecoveryId, xattr: TemporaryXattr, inner: B::Recovered) -> Self {
        Self {
            old_id,
            xattr,
            inner,
        }
    }

    pub fn old_id(&self) -> RecoveryId {
        self.old_id
    }

    pub fn temporary_xattr(&self) -> TemporaryXattr {
        self.xattr
    }

    pub fn content(&self) -> B::Content {
        self.inner.content()
    }

    /// Install the survivor under a new identity in the recovered layer.
    pub fn keep_as(self, id: RecoveryId) -> Result<Arc<RecoverableTemporary<B>>, JournalError> {
        let inner = self.inner.keep_as_temporary(id, self.xattr)?;
        Ok(RecoverableTemporary::adopted(id, self.xattr, inner))
    }

    fn set_xattr(&mut self, xattr: TemporaryXattr) {
        self.xattr = xattr;
    }

    fn overwrite(&mut self, xattr: TemporaryXattr, inner: B::Recovered) {
        self.xattr = xattr;
        self.inner = inner;
    }
}

/// Startup-time journaling layer: constructed over blob-layer recovery,
/// replays the journal, surfaces surviving temporaries, and becomes the
/// live layer at `finish`.
pub struct JournalRecovery<R: BlobRecovery> {
    blob: R,
    registry: Arc<Registry<R::Store>>,
    staging: HashMap<u64, <R::Store as BlobStore>::Recovered>,
    temporaries: BTreeMap<RecoveryId, RecoveredTemporary<R::Store>>,
    /// The replayed journal file, held until `finish` so it outlives the
    /// blob layer's own durability barrier.
    old_journal: Option<<R::Store as BlobStore>::Recovered>,
    config: JournalConfig,
}

impl<R: BlobRecovery> JournalRecovery<R> {
    pub fn new(blob: R) -> Result<Self, JournalError> {
        Self::with_config(blob, JournalConfig::default())
    }

    pub fn with_config(mut blob: R, config: JournalConfig) -> Result<Self, JournalError> {
        config.validate()?;

        let mut staging = HashMap::new();
        for survivor in blob.recover_temporaries(RecoveryType::Staging)? {
            staging.insert(survivor.old_id().id, survivor);
        }

        let mut temporaries = BTreeMap::new();
        for ty in RecoveryType::ALL {
            if ty == RecoveryType::Staging || ty == RecoveryType::Journal {
                continue;
            }
            for survivor in blob.recover_temporaries(ty)? {
                let recovered = RecoveredTemporary::from_survivor(survivor)?;
                temporaries.insert(recovered.old_id(), recovered);
            }
        }

        let mut journals = blob.recover_temporaries(RecoveryType::Journal)?;
        assert!(
            journals.len() <= 1,
            "multiple journal files survived; the blob store is corrupt"
        );

        let mut recovery = Self {
            blob,
            registry: Registry::new(),
            staging,
            temporaries,
            old_journal: None,
            config,
        };
        if let Some(journal) = journals.pop() {
            recovery.replay_journal(journal.content())?;
            recovery.old_journal = Some(journal);
        }
        Ok(recovery)
    }

    /// As [`JournalLayer::open_object`], but synchronous against the
    /// blob-layer recovery surface.
    pub fn get_object(
        &mut self,
        id: ObjectId,
    ) -> Result<Option<Arc<Object<R::Store>>>, JournalError> {
        if let Some(object) = self.registry.lookup(id) {
            return Ok(Some(object));
        }
        match self.blob.get_object(id)? {
            Some(inner) => Ok(Some(Object::from_inner(self.registry.clone(), id, inner)?)),
            None => Ok(None),
        }
    }

    /// Extract every surviving temporary of one type, removing them from
    /// the recovery map. Whatever the caller does not extract is discarded
    /// at `finish`.
    pub fn recover_temporaries(&mut self, ty: RecoveryType) -> Vec<RecoveredTemporary<R::Store>> {
        let ids: Vec<RecoveryId> = self
            .temporaries
            .range(RecoveryId::new(ty, 0)..)
            .take_while(|(id, _)| id.ty == ty)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .map(|id| {
                self.temporaries
                    .remove(&id)
                    .expect("recovered id just listed")
            })
            .collect()
    }

    /// Conclude recovery: discard unclaimed survivors, finish the blob
    /// layer, allocate and tag a fresh journal file, and start the write
    /// queue. Must run inside a tokio runtime.
    pub fn finish(self) -> Result<Arc<JournalLayer<R::Store>>, JournalError> {
        let Self {
            blob,
            registry,
            staging,
            temporaries,
            old_journal,
            config,
        } = self;
        drop(staging);
        drop(temporaries);

        let store = blob.finish();
        // Only now, with the blob layer settled, is the replayed journal
        // safe to discard.
        drop(old_journal);
        let journal_file = store.new_temporary()?;
        journal_file.set_recovery_id(RecoveryId::new(RecoveryType::Journal, 0))?;
        info!("event=journal_ready block_size={}", config.block_size);
        Ok(JournalLayer::start(
            Arc::new(store),
            registry,
            config,
            journal_file,
        ))
    }

    fn replay_journal(
        &mut self,
        content: <R::Store as BlobStore>::Content,
    ) -> Result<(), JournalError> {
        let start = content.start();
        let end = content.size().end_marker;
        let mut bytes = vec![0u8; end.saturating_sub(start) as usize];
        content.read(start, &mut bytes)?;

        let mut pending: Vec<JournalEntry> = Vec::new();
        let mut countdown: u32 = 0;
        let mut transactions = 0usize;
        let mut entries = 0usize;
        let mut torn = false;

        for record in bytes.chunks_exact(JOURNAL_ENTRY_BYTES) {
            if countdown == 0 && JournalEntry::is_zeroed(record) {
                // Punched or never-written space between transactions.
                continue;
            }
            let entry = match JournalEntry::decode(record) {
                Ok(entry) => entry,
                Err(_) => {
                    torn = true;
                    break;
                }
            };
            if countdown > 0 && entry.tx_size != countdown {
                torn = true;
                break;
            }
            if countdown == 0 && entry.tx_size == 0 {
                torn = true;
                break;
            }
            countdown = entry.tx_size - 1;
            pending.push(entry);
            if countdown == 0 {
                // The countdown closed: this transaction was fully
                // journaled, so replay it as a unit.
                entries += pending.len();
                transactions += 1;
                for entry in pending.drain(..) {
                    self.replay_entry(entry)?;
                }
            }
        }

        if torn || !pending.is_empty() {
            // Partially flushed tail, typically trailing garbage or zeros
            // from a file whose end pointer ran ahead of its content.
            warn!(
                "event=journal_torn_tail buffered_entries={}",
                pending.len()
            );
        }
        info!("event=journal_replayed transactions={transactions} entries={entries}");
        Ok(())
    }

    fn replay_entry(&mut self, entry: JournalEntry) -> Result<(), JournalError> {
        let staging = if entry.ty.carries_content() {
            match self.staging.remove(&entry.staging_id) {
                Some(staging) => Some(staging),
                // The staging file is gone: the previous run already
                // carried this operation out.
                None => return Ok(()),
            }
        } else {
            None
        };

        match (entry.ty, entry.target) {
            (
                EntryType::CreateObject | EntryType::UpdateObject,
                EntryTarget::Object { id, xattr },
            ) => {
                staging
                    .expect("content-carrying entry")
                    .keep_as_object(id, xattr)?;
            }
            (EntryType::UpdateXattr, EntryTarget::Object { id, xattr }) => {
                if let Some(object) = self.blob.get_object(id)? {
                    object.set_xattr(xattr)?;
                }
            }
            (EntryType::DeleteObject, EntryTarget::Object { id, .. }) => {
                if let Some(object) = self.blob.get_object(id)? {
                    object.remove()?;
                }
            }
            (EntryType::CreateTemporary, EntryTarget::Temporary { id, xattr }) => {
                if !self.temporaries.contains_key(&id) {
                    let staging = staging.expect("content-carrying entry");
                    self.temporaries
                        .insert(id, RecoveredTemporary::adopted(id, xattr, staging));
                }
            }
            (EntryType::UpdateTemporary, EntryTarget::Temporary { id, xattr }) => {
                if let Some(existing) = self.temporaries.get_mut(&id) {
                    existing.overwrite(xattr, staging.expect("content-carrying entry"));
                }
            }
            (EntryType::UpdateTemporaryXattr, EntryTarget::Temporary { id, xattr }) => {
                if let Some(existing) = self.temporaries.get_mut(&id) {
                    existing.set_xattr(xattr);
                }
            }
            (EntryType::DeleteTemporary, EntryTarget::Temporary { id, .. }) => {
                self.temporaries.remove(&id);
            }
            _ => unreachable!("decode pairs the entry type with its target"),
        }
        Ok(())
    }
}
