//! Recovery behavior: journal replay, torn tails, punched prefixes, and
//! idempotence. Crash points are modeled by leaking handles so the backing
//! files survive into a recovery view over the same store state.

mod common;

use common::{read_all, staged_temp, start_layer, temp_xattr, xattr};
use strata::{
    BlobStore, BlobTemporary, Content, EntryTarget, EntryType, JournalEntry, JournalRecovery,
    MemoryBlobStore, ObjectId, RecoveryId, RecoveryType, JOURNAL_ENTRY_BYTES,
};

/// Plant a journal file with the given records, as a crashed run would
/// leave it.
fn plant_journal(store: &MemoryBlobStore, records: &[Vec<u8>]) {
    let journal = store.new_temporary().expect("journal temporary");
    let mut bytes = Vec::new();
    for record in records {
        bytes.extend_from_slice(record);
    }
    journal.content().write(0, &bytes).expect("write journal");
    journal
        .set_recovery_id(RecoveryId::new(RecoveryType::Journal, 0))
        .expect("tag journal");
    std::mem::forget(journal);
}

/// Plant a staging file, as left behind by a transaction journaled but not
/// applied before the crash.
fn plant_staging(store: &MemoryBlobStore, id: u64, data: &[u8]) {
    let temp = store.new_temporary().expect("staging temporary");
    temp.content().write(0, data).expect("write staging");
    temp.set_recovery_id(RecoveryId::new(RecoveryType::Staging, id))
        .expect("tag staging");
    std::mem::forget(temp);
}

fn create_object_record(id: ObjectId, tag: u8, tx_size: u32, staging_id: u64) -> Vec<u8> {
    JournalEntry {
        ty: EntryType::CreateObject,
        tx_size,
        staging_id,
        target: EntryTarget::Object {
            id,
            xattr: xattr(tag),
        },
    }
    .encode()
    .to_vec()
}

#[tokio::test]
async fn empty_store_recovers_to_a_working_layer() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let id = ObjectId::from_u128(1);

    let mut tx = layer.begin_transaction();
    tx.create_object(id, xattr(1), staged_temp(&layer, b"first"));
    tx.commit().await.expect("commit");
    layer.quiesce().await;
    assert!(store.contains_object(id));
}

#[tokio::test]
async fn journaled_but_unapplied_transaction_replays() {
    let store = MemoryBlobStore::new();
    let object_id = ObjectId::from_u128(2);

    // One committed transaction: create an object from staging file 0 and
    // delete the pre-existing checkpoint temporary, crashed before apply.
    let survivor = store.new_temporary().expect("temporary");
    survivor.content().write(0, b"payload").expect("write");
    survivor
        .set_recovery_id_with_xattr(RecoveryId::new(RecoveryType::Checkpoint, 1), temp_xattr(1))
        .expect("tag");
    std::mem::forget(survivor);

    plant_staging(&store, 0, b"derived");
    plant_journal(
        &store,
        &[
            create_object_record(object_id, 2, 2, 0),
            JournalEntry {
                ty: EntryType::DeleteTemporary,
                tx_size: 1,
                staging_id: 0,
                target: EntryTarget::Temporary {
                    id: RecoveryId::new(RecoveryType::Checkpoint, 1),
                    xattr: temp_xattr(1),
                },
            }
            .encode()
            .to_vec(),
        ],
    );

    let mut recovery = JournalRecovery::new(store.recovery()).expect("recover");
    // The journaled delete already dropped the checkpoint temporary.
    assert!(recovery
        .recover_temporaries(RecoveryType::Checkpoint)
        .is_empty());
    let object = recovery
        .get_object(object_id)
        .expect("get")
        .expect("replayed create");
    assert_eq!(object.xattr(), xattr(2));
    assert_eq!(read_all(&object.content()), b"derived");
    drop(object);

    let layer = recovery.finish().expect("finish");
    layer.quiesce().await;
    assert!(store.contains_object(object_id));
}

#[tokio::test]
async fn torn_tail_stops_replay_at_the_countdown_mismatch() {
    let store = MemoryBlobStore::new();
    for staging_id in 0..4u64 {
        plant_staging(&store, staging_id, format!("v{staging_id}").as_bytes());
    }
    // A complete three-record transaction, then a record whose countdown
    // claims another follows, but the tail is garbage.
    let mut garbage = vec![0xa5u8; JOURNAL_ENTRY_BYTES];
    garbage[0] = 0xff;
    plant_journal(
        &store,
        &[
            create_object_record(ObjectId::from_u128(10), 1, 3, 0),
            create_object_record(ObjectId::from_u128(11), 1, 2, 1),
            create_object_record(ObjectId::from_u128(12), 1, 1, 2),
            create_object_record(ObjectId::from_u128(13), 1, 2, 3),
            garbage,
        ],
    );

    let recovery = JournalRecovery::new(store.recovery()).expect("recover");
    let layer = recovery.finish().expect("finish");
    layer.quiesce().await;

    for id in [10u128, 11, 12] {
        assert!(store.contains_object(ObjectId::from_u128(id)));
    }
    assert!(!store.contains_object(ObjectId::from_u128(13)));
    // The orphaned staging file for the torn transaction is gone too.
    assert!(store
        .temporary_ids()
        .iter()
        .all(|id| id.ty != RecoveryType::Staging));
}

#[tokio::test]
async fn unterminated_transaction_is_discarded_whole() {
    let store = MemoryBlobStore::new();
    plant_staging(&store, 0, b"half");
    // The file ends mid-transaction: countdown never reaches one.
    plant_journal(
        &store,
        &[create_object_record(ObjectId::from_u128(20), 1, 2, 0)],
    );

    let recovery = JournalRecovery::new(store.recovery()).expect("recover");
    recovery.finish().expect("finish");
    assert!(!store.contains_object(ObjectId::from_u128(20)));
}

#[tokio::test]
async fn zero_padded_tail_stops_replay_cleanly() {
    let store = MemoryBlobStore::new();
    plant_staging(&store, 0, b"kept");
    plant_journal(
        &store,
        &[
            create_object_record(ObjectId::from_u128(30), 1, 1, 0),
            vec![0u8; JOURNAL_ENTRY_BYTES],
            vec![0u8; JOURNAL_ENTRY_BYTES],
        ],
    );

    let recovery = JournalRecovery::new(store.recovery()).expect("recover");
    recovery.finish().expect("finish");
    assert!(store.contains_object(ObjectId::from_u128(30)));
}

#[tokio::test]
async fn punched_prefix_is_skipped_to_the_surviving_tail() {
    let store = MemoryBlobStore::new();
    plant_staging(&store, 7, b"tail");
    // An earlier, already-applied transaction's region was hole punched;
    // only zeroed records remain ahead of the unapplied tail.
    plant_journal(
        &store,
        &[
            vec![0u8; JOURNAL_ENTRY_BYTES],
            vec![0u8; JOURNAL_ENTRY_BYTES],
            vec![0u8; JOURNAL_ENTRY_BYTES],
            create_object_record(ObjectId::from_u128(40), 4, 1, 7),
        ],
    );

    let recovery = JournalRecovery::new(store.recovery()).expect("recover");
    recovery.finish().expect("finish");
    assert!(store.contains_object(ObjectId::from_u128(40)));
}

#[tokio::test]
async fn replay_converges_regardless_of_how_far_apply_got() {
    let object_id = ObjectId::from_u128(50);
    let journal_records = vec![
        create_object_record(object_id, 1, 1, 0),
        JournalEntry {
            ty: EntryType::UpdateObject,
            tx_size: 1,
            staging_id: 1,
            target: EntryTarget::Object {
                id: object_id,
                xattr: xattr(2),
            },
        }
        .encode()
        .to_vec(),
    ];

    // Crash before any apply: both staging files survive.
    let fresh = MemoryBlobStore::new();
    plant_staging(&fresh, 0, b"v0");
    plant_staging(&fresh, 1, b"v1");
    plant_journal(&fresh, &journal_records);
    JournalRecovery::new(fresh.recovery())
        .expect("recover")
        .finish()
        .expect("finish");

    // Crash after the first transaction applied: its staging file is gone
    // and the object already exists with the first content.
    let partial = MemoryBlobStore::new();
    {
        let temp = partial.new_temporary().expect("temporary");
        temp.content().write(0, b"v0").expect("write");
        partial
            .create_object(object_id, xattr(1), temp)
            .expect("pre-applied object");
    }
    plant_staging(&partial, 1, b"v1");
    plant_journal(&partial, &journal_records);
    JournalRecovery::new(partial.recovery())
        .expect("recover")
        .finish()
        .expect("finish");

    for store in [&fresh, &partial] {
        assert!(store.contains_object(object_id));
        let object = store
            .open_object(object_id)
            .await
            .expect("open")
            .expect("exists");
        use strata::BlobObject;
        assert_eq!(object.xattr().expect("xattr"), xattr(2));
        assert_eq!(read_all(&object.content()), b"v1");
    }
}

#[tokio::test]
async fn surviving_temporaries_are_reclaimed_with_keep_as() {
    let store = MemoryBlobStore::new();

    // First run: persist a checkpoint temporary, then crash.
    {
        let layer = start_layer(&store);
        let mut tx = layer.begin_transaction();
        let temp = tx
            .create_recoverable_temporary(
                RecoveryId::new(RecoveryType::Checkpoint, 7),
                temp_xattr(3),
                staged_temp(&layer, b"spool"),
            )
            .temporary();
        tx.commit().await.expect("commit");
        layer.quiesce().await;
        std::mem::forget(temp);
        std::mem::forget(layer);
    }

    // Second run: the survivor comes back under its old id, and keep_as
    // re-registers it under a new one.
    let mut recovery = JournalRecovery::new(store.recovery()).expect("recover");
    let mut survivors = recovery.recover_temporaries(RecoveryType::Checkpoint);
    assert_eq!(survivors.len(), 1);
    let survivor = survivors.pop().expect("one survivor");
    assert_eq!(
        survivor.old_id(),
        RecoveryId::new(RecoveryType::Checkpoint, 7)
    );
    assert_eq!(survivor.temporary_xattr(), temp_xattr(3));
    assert_eq!(read_all(&survivor.content()), b"spool");

    let reclaimed = survivor
        .keep_as(RecoveryId::new(RecoveryType::Checkpoint, 9))
        .expect("keep survivor");
    let layer = recovery.finish().expect("finish");
    assert!(store
        .temporary_ids()
        .contains(&RecoveryId::new(RecoveryType::Checkpoint, 9)));
    assert!(!store
        .temporary_ids()
        .contains(&RecoveryId::new(RecoveryType::Checkpoint, 7)));

    // The reclaimed temporary is a first-class citizen of the new layer.
    let mut tx = layer.begin_transaction();
    let facade = tx.wrap_temporary(&reclaimed).expect("no contention");
    facade.set_xattr(temp_xattr(4));
    drop(facade);
    tx.commit().await.expect("commit");
    layer.quiesce().await;
    assert_eq!(reclaimed.temporary_xattr(), temp_xattr(4));
}

#[tokio::test]
async fn commit_without_quiesce_survives_a_crash() {
    let store = MemoryBlobStore::new();
    let id = ObjectId::from_u128(60);

    // Commit resolves once the journal record is durable; crash with the
    // apply still queued.
    {
        let layer = start_layer(&store);
        let mut tx = layer.begin_transaction();
        let created = tx.create_object(id, xattr(5), staged_temp(&layer, b"durable"));
        std::mem::forget(created.object());
        drop(created);
        tx.commit().await.expect("commit");
        std::mem::forget(layer);
    }

    let mut recovery = JournalRecovery::new(store.recovery()).expect("recover");
    let object = recovery
        .get_object(id)
        .expect("get")
        .expect("committed object recovered");
    assert_eq!(object.xattr(), xattr(5));
    assert_eq!(read_all(&object.content()), b"durable");
}
