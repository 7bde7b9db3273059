//! Shared state through which the tasks of a pull pipeline coordinate.
//!
//! The chunk scheduler, the download workers, and the chunk streamer all operate on one
//! [`PipelineState`].  Every piece of mutable state lives behind a single mutex, every mutation
//! is followed by a broadcast wake-up, and any task waiting for a condition re-checks its
//! predicate under the lock each time it's woken.  None of these waits are on a hot path (they
//! fire at chunk granularity, not per byte), so one lock plus one broadcast is plenty, and it
//! makes the lost-wakeup analysis trivial.
use crate::PullTarError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What the pipeline knows about one chunk of the remote archive.
///
/// Records live in [`Inner::chunks`], indexed by chunk number.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChunkRecord {
    /// The spool file holding the chunk's bytes.
    ///
    /// Set when the download worker finishes writing the chunk, and cleared again when the
    /// streamer has fed the file into the unpack pipeline and deleted it.
    pub(crate) file_path: Option<PathBuf>,

    /// The error which made this chunk's download fail, if it did fail.
    pub(crate) error: Option<Arc<PullTarError>>,

    /// Whether the chunk's bytes are completely written to the spool file.
    pub(crate) completed: bool,
}

/// The mutable state of a pull pipeline.  Guarded by the one mutex in [`PipelineState`].
#[derive(Debug)]
pub(crate) struct Inner {
    /// Per-chunk bookkeeping, indexed by chunk number.
    pub(crate) chunks: Vec<ChunkRecord>,

    /// Number of download workers currently running.
    pub(crate) active_workers: usize,

    /// Number of chunks admitted to the pipeline whose spool files haven't been deleted yet.
    ///
    /// A chunk counts against this from the moment the scheduler admits it, all the way through
    /// its download, until the streamer deletes its spool file.  This is what bounds the disk
    /// space the pipeline can consume.  Failed downloads never give their slot back, but by then
    /// the pipeline is shutting down and nothing new gets scheduled anyway.
    pub(crate) chunks_on_disk: usize,

    /// The first error any task reported, if any.
    ///
    /// Once set, this never changes, and the pipeline's cancellation token is triggered.
    pub(crate) failure: Option<Arc<PullTarError>>,
}

/// Shared coordination state for one run of the pull pipeline.
pub(crate) struct PipelineState {
    inner: Mutex<Inner>,
    changed: Notify,
    cancel: CancellationToken,
    bytes_downloaded: AtomicU64,
}

impl PipelineState {
    pub(crate) fn new(total_chunks: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunks: vec![ChunkRecord::default(); total_chunks],
                active_workers: 0,
                chunks_on_disk: 0,
                failure: None,
            }),
            changed: Notify::new(),
            cancel: CancellationToken::new(),
            bytes_downloaded: AtomicU64::new(0),
        }
    }

    /// Run `f` against the mutable state, then wake every task waiting on the state.
    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            f(&mut inner)
        };

        self.changed.notify_waiters();

        result
    }

    /// Wait until `predicate` yields a value, re-checking it every time the state changes.
    ///
    /// The predicate runs under the state lock, so it's allowed to mutate the state when it
    /// decides to proceed; check-then-act sequences like "if there's capacity, claim it" are
    /// atomic that way.
    pub(crate) async fn wait_until<T>(
        &self,
        mut predicate: impl FnMut(&mut Inner) -> Option<T>,
    ) -> T {
        loop {
            // Arm the notification before checking the predicate, so a state change that happens
            // between the check and the await still wakes us
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(value) = predicate(&mut self.inner.lock().unwrap()) {
                return value;
            }

            changed.await;
        }
    }

    /// Record a task failure and cancel all in-flight work.
    ///
    /// Only the first reported error is kept; the errors that follow it are almost always
    /// knock-on effects of the first one, and the first is what the caller needs to see.
    pub(crate) fn fail(&self, error: Arc<PullTarError>) {
        let first = {
            let mut inner = self.inner.lock().unwrap();

            if inner.failure.is_none() {
                inner.failure = Some(error);
                true
            } else {
                false
            }
        };

        if first {
            self.cancel.cancel();
        }

        self.changed.notify_waiters();
    }

    pub(crate) fn failure(&self) -> Option<Arc<PullTarError>> {
        self.inner.lock().unwrap().failure.clone()
    }

    /// The token which is cancelled as soon as any task reports a failure.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Add to the running total of downloaded bytes, returning the new total.
    pub(crate) fn add_bytes_downloaded(&self, bytes: u64) -> u64 {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// Take all chunk records out of the state, leaving it empty.
    ///
    /// Used during shutdown: the caller gets every spool file path still registered so the files
    /// can be deleted, and dropping the records releases their `Arc` clones of the failure.
    pub(crate) fn take_records(&self) -> Vec<ChunkRecord> {
        std::mem::take(&mut self.inner.lock().unwrap().chunks)
    }

    /// Take the failure out of the state.
    pub(crate) fn take_failure(&self) -> Option<Arc<PullTarError>> {
        self.inner.lock().unwrap().failure.take()
    }
}

impl std::fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineState")
            .field("inner", &self.inner)
            .field("bytes_downloaded", &self.bytes_downloaded)
            .finish()
    }
}
