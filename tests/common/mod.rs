#![allow(dead_code)]

use std::sync::Arc;
use strata::blob::MemoryTemporary;
use strata::{
    BlobTemporary, Content, JournalLayer, JournalRecovery, MemoryBlobStore, TemporaryXattr, Xattr,
};

pub fn xattr(tag: u8) -> Xattr {
    Xattr([tag; 16])
}

pub fn temp_xattr(tag: u8) -> TemporaryXattr {
    TemporaryXattr([tag; 16])
}

/// Bring up a journaling layer over the store's current state, the way a
/// process start would.
pub fn start_layer(store: &MemoryBlobStore) -> Arc<JournalLayer<MemoryBlobStore>> {
    JournalRecovery::new(store.recovery())
        .expect("recovery over memory store")
        .finish()
        .expect("finish recovery")
}

/// A detached temporary pre-filled with `data`, ready to stage.
pub fn staged_temp(layer: &JournalLayer<MemoryBlobStore>, data: &[u8]) -> MemoryTemporary {
    let temp = layer.new_detached_temporary().expect("new temporary");
    temp.content().write(0, data).expect("fill temporary");
    temp
}

pub fn read_all<C: Content>(content: &C) -> Vec<u8> {
    let mut buf = vec![0u8; content.size().end_marker as usize];
    content.read(0, &mut buf).expect("read content");
    buf
}
