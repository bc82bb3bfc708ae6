//! Ordered application of committed transactions.
//!
//! Commits enqueue their staged mutations before awaiting the journal sync,
//! so queue order is commit order. The queue task releases a batch only
//! after its journal record is durable, applies in order, syncs the blob
//! store, then zeroes the consumed journal region on block boundaries so it
//! can be reclaimed. The hole punch for a transaction therefore never
//! overtakes the apply of any earlier one.

use crate::blob::store::{BlobError, BlobStore, Content};
use log::error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub(crate) type ApplyFn<B> = Box<dyn FnOnce(&B) -> Result<(), BlobError> + Send>;

pub(crate) struct ApplyBatch<B: BlobStore> {
    pub(crate) applies: Vec<ApplyFn<B>>,
    pub(crate) old_pos: u64,
    pub(crate) new_pos: u64,
    /// Fired by the committer once the journal record is durable.
    pub(crate) synced: oneshot::Receiver<()>,
}

enum QueueCommand<B: BlobStore> {
    Apply(ApplyBatch<B>),
    Quiesce(oneshot::Sender<()>),
}

pub(crate) struct WriteQueue<B: BlobStore> {
    tx: mpsc::UnboundedSender<QueueCommand<B>>,
}

impl<B: BlobStore> Clone for WriteQueue<B> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<B: BlobStore> WriteQueue<B> {
    /// Spawn the apply task. Must run inside a tokio runtime; the task ends
    /// when the owning layer drops its last sender.
    pub(crate) fn start(blob: Arc<B>, journal_content: B::Content, block_size: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, blob, journal_content, block_size));
        Self { tx }
    }

    pub(crate) fn enqueue(&self, batch: ApplyBatch<B>) {
        if self.tx.send(QueueCommand::Apply(batch)).is_err() {
            fatal_protocol("enqueue apply batch", &"write queue task is gone");
        }
    }

    /// Resolves once every batch enqueued before the call has been applied.
    pub(crate) async fn quiesce(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(QueueCommand::Quiesce(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn run<B: BlobStore>(
    mut rx: mpsc::UnboundedReceiver<QueueCommand<B>>,
    blob: Arc<B>,
    journal_content: B::Content,
    block_size: u64,
) {
    while let Some(command) = rx.recv().await {
        match command {
            QueueCommand::Apply(batch) => {
                if batch.synced.await.is_err() {
                    fatal_protocol(
                        "await journal durability",
                        &"commit abandoned before its journal sync",
                    );
                }
                for apply in batch.applies {
                    if let Err(err) = apply(blob.as_ref()) {
                        fatal_protocol("apply journaled mutation", &err);
                    }
                }
                if let Err(err) = blob.sync().await {
                    fatal_protocol("sync blob store", &err);
                }
                // The batch's effects are durable; its journal region can
                // go. Round inward to block boundaries, leaving partial
                // blocks for a later transaction to cover.
                let old = batch.old_pos & !(block_size - 1);
                let new = batch.new_pos & !(block_size - 1);
                if new > old {
                    if let Err(err) = journal_content.zero(old, new - old) {
                        fatal_protocol("punch applied journal region", &err);
                    }
                }
            }
            QueueCommand::Quiesce(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Failures past the journal sync cannot be rolled back in place; the
/// contract is fail-stop, with recovery reconciling at the next start.
pub(crate) fn fatal_protocol(stage: &str, err: &dyn fmt::Display) -> ! {
    error!("event=journal_fatal stage=\"{stage}\" error={err}");
    std::process::abort();
}
