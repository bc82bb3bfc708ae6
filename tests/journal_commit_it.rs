//! Commit-pipeline behavior over the in-memory blob store.

mod common;

use common::{read_all, staged_temp, start_layer, temp_xattr, xattr};
use std::sync::Arc;
use strata::{JournalError, MemoryBlobStore, ObjectId, RecoveryId, RecoveryType};

#[tokio::test]
async fn create_commit_and_read_back() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let id = ObjectId::from_u128(1);

    let mut tx = layer.begin_transaction();
    let created = tx.create_object(id, xattr(1), staged_temp(&layer, b"hello"));
    let object = created.object();
    drop(created);
    tx.commit().await.expect("commit");

    // Committed state is visible through the handle immediately, before
    // the blob-layer apply has necessarily run.
    assert_eq!(object.xattr(), xattr(1));
    assert_eq!(read_all(&object.content()), b"hello");
    assert_eq!(object.generation(), 1);

    // A fresh open returns the registered handle while it lives.
    let reopened = layer
        .open_object(id)
        .await
        .expect("open")
        .expect("object exists");
    assert!(Arc::ptr_eq(&object, &reopened));

    layer.quiesce().await;
    assert!(store.contains_object(id));
    // The staging file was consumed by the apply.
    assert!(store
        .temporary_ids()
        .iter()
        .all(|id| id.ty != RecoveryType::Staging));

    // Once every handle is gone, opening goes back to the blob store and
    // sees the applied state.
    drop(object);
    drop(reopened);
    let fresh = layer
        .open_object(id)
        .await
        .expect("open")
        .expect("object exists");
    assert_eq!(fresh.xattr(), xattr(1));
    assert_eq!(read_all(&fresh.content()), b"hello");
    assert_eq!(fresh.generation(), 0);
}

#[tokio::test]
async fn xattr_only_update_bumps_generation_and_stages_nothing() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let id = ObjectId::from_u128(2);

    let mut tx = layer.begin_transaction();
    let object = tx
        .create_object(id, xattr(1), staged_temp(&layer, b"hello"))
        .object();
    tx.commit().await.expect("commit");
    layer.quiesce().await;

    let mut tx = layer.begin_transaction();
    let facade = tx.wrap_object(&object).expect("no contention");
    facade.set_xattr(xattr(2));
    assert_eq!(facade.xattr(), xattr(2));
    assert_eq!(facade.generation(), 2);
    drop(facade);
    tx.commit().await.expect("commit");

    assert_eq!(object.xattr(), xattr(2));
    assert_eq!(object.generation(), 2);
    assert_eq!(read_all(&object.content()), b"hello");
    // An xattr-only transaction never creates a staging file.
    assert!(store
        .temporary_ids()
        .iter()
        .all(|id| id.ty != RecoveryType::Staging));
}

#[tokio::test]
async fn content_update_reads_new_bytes_before_apply() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let id = ObjectId::from_u128(3);

    let mut tx = layer.begin_transaction();
    let object = tx
        .create_object(id, xattr(1), staged_temp(&layer, b"old"))
        .object();
    tx.commit().await.expect("commit");
    layer.quiesce().await;

    let mut tx = layer.begin_transaction();
    let facade = tx.wrap_object(&object).expect("no contention");
    facade.overwrite(xattr(2), staged_temp(&layer, b"new"));
    // The pending shadow serves reads inside the transaction.
    assert_eq!(read_all(&facade.content()), b"new");
    drop(facade);
    tx.commit().await.expect("commit");

    assert_eq!(read_all(&object.content()), b"new");
    assert_eq!(object.generation(), 2);

    layer.quiesce().await;
    drop(object);
    let fresh = layer
        .open_object(id)
        .await
        .expect("open")
        .expect("object exists");
    assert_eq!(read_all(&fresh.content()), b"new");
    assert_eq!(fresh.xattr(), xattr(2));
}

#[tokio::test]
async fn create_and_remove_in_one_transaction_is_a_noop() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let id = ObjectId::from_u128(4);

    let mut tx = layer.begin_transaction();
    let created = tx.create_object(id, xattr(1), staged_temp(&layer, b"fleeting"));
    created.remove();
    let object = created.object();
    drop(created);
    tx.commit().await.expect("commit");
    layer.quiesce().await;

    assert!(!store.contains_object(id));
    assert!(store
        .temporary_ids()
        .iter()
        .all(|id| id.ty != RecoveryType::Staging));

    drop(object);
    assert!(layer.open_object(id).await.expect("open").is_none());
}

#[tokio::test]
async fn wrap_conflict_fails_fast_and_clears_with_the_holder() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let id = ObjectId::from_u128(5);

    let mut tx = layer.begin_transaction();
    let object = tx
        .create_object(id, xattr(1), staged_temp(&layer, b"contended"))
        .object();
    tx.commit().await.expect("commit");
    layer.quiesce().await;

    let mut first = layer.begin_transaction();
    let holder = first.wrap_object(&object).expect("first wrap");

    let mut second = layer.begin_transaction();
    let err = second.wrap_object(&object).expect_err("lock is taken");
    assert!(err.is_conflict());

    // Dropping the first transaction without committing releases the lock
    // and leaves the system unchanged.
    drop(holder);
    drop(first);
    let facade = second.wrap_object(&object).expect("lock released");
    facade.set_xattr(xattr(9));
    drop(facade);
    second.commit().await.expect("commit");
    assert_eq!(object.xattr(), xattr(9));
}

#[tokio::test]
async fn commit_consuming_removes_the_temporary_atomically() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let temp_id = RecoveryId::new(RecoveryType::Checkpoint, 1);
    let object_id = ObjectId::from_u128(6);

    let mut tx = layer.begin_transaction();
    let temp = tx
        .create_recoverable_temporary(temp_id, temp_xattr(1), staged_temp(&layer, b"payload"))
        .temporary();
    tx.commit().await.expect("commit");
    layer.quiesce().await;
    assert!(store.temporary_ids().contains(&temp_id));

    let mut tx = layer.begin_transaction();
    tx.create_object(object_id, xattr(2), staged_temp(&layer, b"derived"));
    tx.commit_consuming(temp).await.expect("commit");
    layer.quiesce().await;

    assert!(store.contains_object(object_id));
    assert!(!store.temporary_ids().contains(&temp_id));
}

#[tokio::test]
async fn commit_consuming_a_locked_temporary_aborts_the_transaction() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let temp_id = RecoveryId::new(RecoveryType::Checkpoint, 2);
    let object_id = ObjectId::from_u128(8);

    let mut tx = layer.begin_transaction();
    let temp = tx
        .create_recoverable_temporary(temp_id, temp_xattr(1), staged_temp(&layer, b"payload"))
        .temporary();
    tx.commit().await.expect("commit");
    layer.quiesce().await;

    let mut holder = layer.begin_transaction();
    let held = holder.wrap_temporary(&temp).expect("first wrap");

    // Consuming is a wrap like any other: the conflict surfaces to the
    // caller with nothing journaled.
    let mut tx = layer.begin_transaction();
    tx.create_object(object_id, xattr(2), staged_temp(&layer, b"derived"));
    let err = tx
        .commit_consuming(temp.clone())
        .await
        .expect_err("temporary is locked");
    assert!(matches!(&err, JournalError::TemporaryLocked(id) if *id == temp_id));
    assert!(err.is_conflict());
    layer.quiesce().await;
    assert!(!store.contains_object(object_id));
    assert!(store.temporary_ids().contains(&temp_id));

    // Dropping the holder releases the lock; the retry goes through.
    drop(held);
    drop(holder);
    let mut tx = layer.begin_transaction();
    tx.create_object(object_id, xattr(2), staged_temp(&layer, b"derived"));
    tx.commit_consuming(temp).await.expect("commit");
    layer.quiesce().await;
    assert!(store.contains_object(object_id));
    assert!(!store.temporary_ids().contains(&temp_id));
}

#[tokio::test]
async fn recoverable_temporary_update_round_trips() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let temp_id = RecoveryId::new(RecoveryType::Backlog, 40);

    let mut tx = layer.begin_transaction();
    let temp = tx
        .create_recoverable_temporary(temp_id, temp_xattr(1), staged_temp(&layer, b"v1"))
        .temporary();
    tx.commit().await.expect("commit");
    layer.quiesce().await;

    let mut tx = layer.begin_transaction();
    let facade = tx.wrap_temporary(&temp).expect("no contention");
    facade.overwrite(temp_xattr(2), staged_temp(&layer, b"v2"));
    drop(facade);
    tx.commit().await.expect("commit");

    assert_eq!(temp.temporary_xattr(), temp_xattr(2));
    assert_eq!(read_all(&temp.content()), b"v2");
    assert_eq!(temp.generation(), 2);

    layer.quiesce().await;
    assert!(store.temporary_ids().contains(&temp_id));
}

#[tokio::test]
async fn generations_advance_by_change_count() {
    let store = MemoryBlobStore::new();
    let layer = start_layer(&store);
    let id = ObjectId::from_u128(7);

    let mut tx = layer.begin_transaction();
    let object = tx
        .create_object(id, xattr(1), staged_temp(&layer, b"gen"))
        .object();
    tx.commit().await.expect("commit");
    assert_eq!(object.generation(), 1);

    let mut tx = layer.begin_transaction();
    let facade = tx.wrap_object(&object).expect("no contention");
    facade.set_xattr(xattr(2));
    facade.set_xattr(xattr(3));
    assert_eq!(facade.generation(), 3);
    drop(facade);
    tx.commit().await.expect("commit");

    assert_eq!(object.generation(), 3);
    assert_eq!(object.xattr(), xattr(3));
}
