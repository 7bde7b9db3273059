//! Download a remote archive in concurrent chunks and unpack it on the fly.
//!
//! A pull runs four kinds of task:
//!
//! * The *scheduler* admits chunks to the pipeline in order, as capacity allows.
//! * One *download worker* per admitted chunk downloads its byte range into a spool file.
//! * The *streamer* feeds completed spool files, strictly in chunk order, into an in-memory
//!   pipe, deleting each file once its bytes are in the pipe.
//! * The *unpacker* reads the reassembled archive byte stream from the other end of the pipe
//!   and extracts it (see [`crate::extract`]).
//!
//! Downloads happen out of order; the spool files and the streamer are what turn them back into
//! one ordered byte stream.  The number of concurrent workers and the number of spool files
//! allowed on disk are both bounded, so neither memory nor disk grows with the archive size.
//!
//! All coordination happens through [`state::PipelineState`].  The first task to fail latches
//! its error there and cancels everything else; the error that comes out of the job is always
//! that first one.
use crate::downloader::ChunkDownloader;
use crate::progress::{NotificationSink, ProgressNotification};
use crate::{error, Config, PullTarError, Result};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, TryStreamExt};
use snafu::prelude::*;
use state::{ChunkRecord, PipelineState};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};

mod state;

/// Capacity of the in-memory pipe between the chunk streamer and the unpack task.
const PIPE_CAPACITY: usize = 64 * 1024;

/// What to pull and where to put it.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    /// Path within the remote storage under which the archive lives, like an S3 key prefix.
    ///
    /// Can be empty if the archive sits at the root of the storage namespace.
    pub source_path: String,

    /// File name of the archive object under [`source_path`](Self::source_path).
    pub filename: String,

    /// Local directory the archive's contents are unpacked into.
    ///
    /// Created if it doesn't exist yet.
    pub destination: PathBuf,

    /// Override of the configured chunk size, for this one download.
    ///
    /// `None` (or a zero size) uses the chunk size from [`Config`].
    pub chunk_size: Option<byte_unit::Byte>,

    /// Correlation id stamped on all whole-archive progress notifications for this pull.
    pub correlation_id: String,

    /// Message carried by the whole-archive progress notifications for this pull.
    pub message: String,
}

/// Creates [`PullJob`] instances, which download and unpack one remote archive each.
#[derive(Debug)]
pub struct PullJobBuilder {
    config: Config,
    downloader: Box<dyn ChunkDownloader>,
    request: DownloadRequest,
}

impl PullJobBuilder {
    pub fn new(
        config: Config,
        downloader: Box<dyn ChunkDownloader>,
        request: DownloadRequest,
    ) -> Self {
        Self {
            config,
            downloader,
            request,
        }
    }

    /// Look up the remote archive and compute the chunk layout of the download.
    ///
    /// This performs the size query against the remote storage; nothing is downloaded yet.
    pub async fn build(self) -> Result<PullJob> {
        let Self {
            config,
            downloader,
            request,
        } = self;

        let remote_path = join_remote_path(&request.source_path, &request.filename);

        let total_bytes = downloader.object_size(&remote_path).await?;

        let mut chunk_size = config.chunk_size.get_bytes() as u64;
        if let Some(override_size) = request.chunk_size {
            if override_size.get_bytes() > 0 {
                chunk_size = override_size.get_bytes() as u64;
            }
        }
        if chunk_size == 0 {
            // A zero chunk size would make the layout degenerate
            chunk_size = Config::default().chunk_size.get_bytes() as u64;
        }

        let total_chunks = total_bytes.div_ceil(chunk_size) as usize;

        debug!(
            remote_path,
            total_bytes, chunk_size, total_chunks, "Computed chunk layout of remote archive"
        );

        Ok(PullJob {
            config,
            downloader,
            request,
            remote_path,
            total_bytes,
            chunk_size,
            total_chunks,
        })
    }
}

/// A pull job, ready to run.
///
/// By the time the job exists, [`PullJobBuilder::build`] has already queried the size of the
/// remote archive, so the chunk layout reported by the accessors here is final.
#[derive(Debug)]
pub struct PullJob {
    config: Config,
    downloader: Box<dyn ChunkDownloader>,
    request: DownloadRequest,
    remote_path: String,
    total_bytes: u64,
    chunk_size: u64,
    total_chunks: usize,
}

impl PullJob {
    /// Total size in bytes of the remote archive.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Size in bytes of each download chunk.  The final chunk of an archive is usually smaller.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks the download is split into.
    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Correlation id stamped on this job's whole-archive progress notifications.
    pub fn correlation_id(&self) -> &str {
        &self.request.correlation_id
    }

    /// Run the pull job without any progress updates
    pub async fn run_without_progress(self, abort: impl Future<Output = ()>) -> Result<()> {
        // A dummy impl of the notification sink trait that doesn't do anything with the
        // notifications
        struct NoProgress {}
        impl NotificationSink for NoProgress {}

        let sink = NoProgress {};

        self.run(abort, sink).await
    }

    /// Run the pull job: download all chunks, reassemble them in order, and unpack the archive
    /// into the destination directory.
    ///
    /// `abort` is a future which, if it completes, causes the job to abort as soon as possible.
    /// Callers that don't need to abort can pass [`futures::future::pending()`].
    ///
    /// Progress is reported to `sink` for the duration of the job.
    pub async fn run<Abort, Sink>(self, abort: Abort, sink: Sink) -> Result<()>
    where
        Abort: Future<Output = ()>,
        Sink: NotificationSink + 'static,
    {
        let sink: Arc<dyn NotificationSink> = Arc::new(sink);
        let destination = self.request.destination.clone();
        let unpack_sink = Arc::clone(&sink);

        self.run_with_consumer(abort, sink, move |reader| async move {
            // The tar walk is synchronous, so it runs on a blocking thread reading from the
            // bridged pipe
            let bridge = SyncIoBridge::new(reader);

            tokio::task::spawn_blocking(move || {
                crate::extract::unpack_stream(bridge, &destination, &unpack_sink)
            })
            .await
            .context(error::SpawnBlockingSnafu)?
        })
        .await
    }

    /// Run the pull pipeline, feeding the reassembled archive byte stream to `consumer` instead
    /// of the standard unpack task.
    ///
    /// This is the seam the pipeline tests use to observe the raw stream; [`Self::run`] plugs
    /// the tar unpacker in here.
    pub(crate) async fn run_with_consumer<Abort, Consumer, Fut>(
        self,
        abort: Abort,
        sink: Arc<dyn NotificationSink>,
        consumer: Consumer,
    ) -> Result<()>
    where
        Abort: Future<Output = ()>,
        Consumer: FnOnce(DuplexStream) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let span = info_span!("pull",
            remote_path = %self.remote_path,
            total_bytes = self.total_bytes,
            total_chunks = self.total_chunks);

        async move {
            info!("Starting pull of remote archive");

            let state = Arc::new(PipelineState::new(self.total_chunks));

            let ctx = Arc::new(PullContext {
                state: Arc::clone(&state),
                downloader: self.downloader,
                remote_path: self.remote_path,
                total_bytes: self.total_bytes,
                chunk_size: self.chunk_size,
                total_chunks: self.total_chunks,
                // Zero workers or zero disk slots would deadlock the scheduler before the first
                // chunk
                worker_count: self.config.worker_count.max(1),
                max_chunks_on_disk: self.config.max_chunks_on_disk.max(1),
                buffer_size: self.config.download_buffer_size.get_bytes() as usize,
                temp_dir: self
                    .config
                    .temp_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir),
                progress: PullProgress {
                    sink,
                    correlation_id: self.request.correlation_id,
                    message: self.request.message,
                    total_bytes: self.total_bytes,
                    started_at: Utc::now(),
                },
            });

            let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);

            let scheduler = tokio::spawn(
                watch_task(Arc::clone(&state), run_scheduler(Arc::clone(&ctx)))
                    .instrument(debug_span!("chunk_scheduler")),
            );
            let streamer = tokio::spawn(
                watch_task(Arc::clone(&state), run_streamer(Arc::clone(&ctx), writer))
                    .instrument(debug_span!("chunk_streamer")),
            );
            let unpacker = tokio::spawn(
                watch_task(Arc::clone(&state), consumer(reader)).instrument(debug_span!("unpacker")),
            );

            let tasks = async {
                let (scheduler, streamer, unpacker) = futures::join!(scheduler, streamer, unpacker);

                (
                    flatten_task(scheduler),
                    flatten_task(streamer),
                    flatten_task(unpacker),
                )
            };
            tokio::pin!(tasks);
            tokio::pin!(abort);

            let (scheduler_result, streamer_result, unpacker_result) = tokio::select! {
                results = &mut tasks => results,
                _ = &mut abort => {
                    info!("Abort requested; cancelling pull");

                    state.fail(Arc::new(error::AbortedSnafu {}.build()));

                    tasks.await
                }
            };

            // The pipeline tasks are done, but a failed run can leave detached download workers
            // behind for a moment; wait them out so every spool file is accounted for before
            // sweeping
            state
                .wait_until(|inner| (inner.active_workers == 0).then_some(()))
                .await;

            let result = match state.take_failure() {
                Some(failure) => {
                    // Any error in the task results is a shared handle to this same failure, and
                    // failed chunk records hold one too; all of those have to go before
                    // try_unwrap can give the error back by value
                    drop((scheduler_result, streamer_result, unpacker_result));
                    cleanup_chunks(state.take_records()).await;

                    Err(match Arc::try_unwrap(failure) {
                        Ok(error) => error,
                        Err(still_shared) => PullTarError::shared(still_shared),
                    })
                }
                None => {
                    let result = scheduler_result.and(streamer_result).and(unpacker_result);

                    if result.is_err() {
                        // Only reachable if a task panicked; sweep anyway
                        cleanup_chunks(state.take_records()).await;
                    }

                    result
                }
            };

            match &result {
                Ok(()) => {
                    ctx.progress.archive_finished();

                    info!("Pull of remote archive complete");
                }
                Err(e) => {
                    error!(err = ?e, "Pull of remote archive failed");
                }
            }

            result
        }
        .instrument(span)
        .await
    }
}

/// Join the remote directory path and the archive file name into the full object path.
fn join_remote_path(source_path: &str, filename: &str) -> String {
    let trimmed = source_path.trim_end_matches('/');

    if trimmed.is_empty() {
        filename.to_string()
    } else {
        format!("{trimmed}/{filename}")
    }
}

/// Read-only context shared by all tasks of one pull.
struct PullContext {
    state: Arc<PipelineState>,
    downloader: Box<dyn ChunkDownloader>,
    remote_path: String,
    total_bytes: u64,
    chunk_size: u64,
    total_chunks: usize,
    worker_count: usize,
    max_chunks_on_disk: usize,
    buffer_size: usize,
    temp_dir: PathBuf,
    progress: PullProgress,
}

/// Emits the whole-archive progress notifications for a pull.
struct PullProgress {
    sink: Arc<dyn NotificationSink>,
    correlation_id: String,
    message: String,
    total_bytes: u64,
    started_at: DateTime<Utc>,
}

impl PullProgress {
    /// Report a new total of downloaded bytes.
    fn archive_downloading(&self, downloaded_bytes: u64) {
        if self.total_bytes == 0 {
            return;
        }

        // Download updates stay below 100%; only `archive_finished` reports completion, after
        // the unpack side is done too
        let percent = (downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(99.9);

        self.sink.notify(
            ProgressNotification::new(&self.correlation_id, &self.message, percent)
                .with_bytes(downloaded_bytes, self.total_bytes)
                .with_started_at(self.started_at),
        );
    }

    /// Report the pull as fully complete.
    fn archive_finished(&self) {
        self.sink.notify(
            ProgressNotification::new(&self.correlation_id, &self.message, 100.0)
                .with_bytes(self.total_bytes, self.total_bytes)
                .with_started_at(self.started_at),
        );
    }
}

/// Run one pipeline task to completion, reporting any failure of it to the shared latch.
///
/// The error itself moves into the latch; the task's result carries a shared handle to it.
/// Whoever fails first wins the latch, and later failures are almost always just fallout of the
/// first one, so they're logged and dropped.
async fn watch_task(
    state: Arc<PipelineState>,
    task: impl Future<Output = Result<()>>,
) -> Result<()> {
    match task.await {
        Ok(()) => {
            debug!("Pipeline task finished");

            Ok(())
        }
        Err(PullTarError::Shared { source }) => {
            // Already latched by whichever task produced it
            Err(PullTarError::Shared { source })
        }
        Err(e) => {
            error!(err = ?e, "Pipeline task failed");

            let shared = Arc::new(e);
            state.fail(Arc::clone(&shared));

            Err(PullTarError::shared(shared))
        }
    }
}

/// Collapse a task join result into the task's own result.
///
/// A `JoinError` means the task panicked; the pipeline never aborts tasks by handle.
fn flatten_task(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    joined.context(error::SpawnSnafu)?
}

/// Admit chunks to the pipeline in order, as worker and disk capacity allows.
///
/// Both capacity counters are claimed atomically, under the state lock, before the chunk's
/// download worker is spawned.  Once any task has failed there's no point starting more
/// downloads; the scheduler stops quietly and leaves the error reporting to whoever latched it.
async fn run_scheduler(ctx: Arc<PullContext>) -> Result<()> {
    for index in 0..ctx.total_chunks {
        let admitted = ctx
            .state
            .wait_until(|inner| {
                if inner.failure.is_some() {
                    return Some(false);
                }

                if inner.active_workers < ctx.worker_count
                    && inner.chunks_on_disk < ctx.max_chunks_on_disk
                {
                    inner.active_workers += 1;
                    inner.chunks_on_disk += 1;

                    Some(true)
                } else {
                    None
                }
            })
            .await;

        if !admitted {
            debug!(next_chunk = index, "Stopping chunk scheduling after pipeline failure");

            return Ok(());
        }

        debug!(chunk = index, "Admitting chunk download");

        tokio::spawn(
            download_chunk(Arc::clone(&ctx), index)
                .instrument(debug_span!("download_chunk", chunk = index)),
        );
    }

    debug!("All chunks scheduled");

    Ok(())
}

/// Download one chunk of the remote archive into a spool file.
///
/// Workers run detached from the pipeline's task set and report everything through the shared
/// state: the spool path and completion flag on success, the error on failure.  Either way the
/// active worker count drops on the way out, which is what the coordinator waits on before it
/// sweeps up.
async fn download_chunk(ctx: Arc<PullContext>, index: usize) {
    match download_chunk_impl(&ctx, index).await {
        Ok(Some(spool_path)) => {
            debug!(chunk = index, path = %spool_path.display(), "Chunk download complete");

            ctx.state.update(|inner| {
                let record = &mut inner.chunks[index];
                record.file_path = Some(spool_path);
                record.completed = true;
                inner.active_workers -= 1;
            });
        }
        Ok(None) => {
            debug!(chunk = index, "Chunk download abandoned after pipeline failure");

            ctx.state.update(|inner| inner.active_workers -= 1);
        }
        Err(e) => {
            error!(chunk = index, err = ?e, "Chunk download failed");

            let shared = Arc::new(e);
            ctx.state.update(|inner| {
                inner.chunks[index].error = Some(Arc::clone(&shared));
                inner.active_workers -= 1;
            });
            ctx.state.fail(shared);
        }
    }
}

/// The work of [`download_chunk`]: returns the spool file path, or `None` if the pipeline was
/// cancelled mid-download.
async fn download_chunk_impl(ctx: &PullContext, index: usize) -> Result<Option<PathBuf>> {
    let start = index as u64 * ctx.chunk_size;
    // Ranges are inclusive on both ends, and the final chunk is clamped to the end of the
    // archive
    let end = (start + ctx.chunk_size).min(ctx.total_bytes) - 1;

    debug!(chunk = index, start, end, "Downloading chunk byte range");

    let mut stream = ctx
        .downloader
        .download_range(&ctx.remote_path, start, end)
        .await?;

    let (spool_file, spool_path) = {
        let temp_dir = ctx.temp_dir.clone();
        let prefix = format!("chunk_{index}_");

        tokio::task::spawn_blocking(move || {
            // keep() detaches the file from tempfile's auto-delete; the pipeline owns its
            // lifetime from here on
            tempfile::Builder::new()
                .prefix(&prefix)
                .tempfile_in(&temp_dir)
                .and_then(|file| file.keep().map_err(|e| e.error))
        })
        .await
        .context(error::SpawnBlockingSnafu)?
        .with_context(|_| error::CreateChunkFileSnafu {
            dir: ctx.temp_dir.clone(),
        })?
    };

    let mut spool_file = tokio::fs::File::from_std(spool_file);

    let copy_result = copy_stream_to_spool(ctx, &mut stream, &mut spool_file, &spool_path).await;

    drop(spool_file);

    match copy_result {
        Ok(true) => Ok(Some(spool_path)),
        Ok(false) => {
            remove_spool_file(&spool_path).await;

            Ok(None)
        }
        Err(e) => {
            remove_spool_file(&spool_path).await;

            Err(e)
        }
    }
}

/// Copy the chunk's byte stream into its spool file, flushing in buffer-sized batches.
///
/// Returns `false` if the pipeline was cancelled mid-copy.
async fn copy_stream_to_spool(
    ctx: &PullContext,
    stream: &mut BoxStream<'static, Result<Bytes>>,
    spool_file: &mut tokio::fs::File,
    spool_path: &Path,
) -> Result<bool> {
    let mut buffer = BytesMut::with_capacity(ctx.buffer_size);

    loop {
        let chunk = tokio::select! {
            _ = ctx.state.cancel_token().cancelled() => return Ok(false),
            chunk = stream.try_next() => chunk?,
        };

        let Some(bytes) = chunk else {
            break;
        };

        buffer.extend_from_slice(&bytes);

        if buffer.len() >= ctx.buffer_size {
            flush_spool_buffer(ctx, spool_file, &mut buffer, spool_path).await?;
        }
    }

    if !buffer.is_empty() {
        flush_spool_buffer(ctx, spool_file, &mut buffer, spool_path).await?;
    }

    spool_file
        .flush()
        .await
        .with_context(|_| error::WriteChunkFileSnafu {
            path: spool_path.to_path_buf(),
        })?;

    Ok(true)
}

/// Write out the buffered bytes and report the overall download progress.
async fn flush_spool_buffer(
    ctx: &PullContext,
    spool_file: &mut tokio::fs::File,
    buffer: &mut BytesMut,
    spool_path: &Path,
) -> Result<()> {
    let bytes = buffer.split().freeze();

    spool_file
        .write_all(&bytes)
        .await
        .with_context(|_| error::WriteChunkFileSnafu {
            path: spool_path.to_path_buf(),
        })?;

    let total_downloaded = ctx.state.add_bytes_downloaded(bytes.len() as u64);
    ctx.progress.archive_downloading(total_downloaded);

    Ok(())
}

/// Feed completed chunks, strictly in chunk order, into the pipe towards the unpack task.
///
/// The pipe writer is closed when the streamer finishes, success or not; that's what carries
/// end-of-stream (or truncation, after a failure) to the unpack side.
async fn run_streamer(ctx: Arc<PullContext>, mut writer: DuplexStream) -> Result<()> {
    let result = stream_chunks(&ctx, &mut writer).await;

    if let Err(e) = writer.shutdown().await {
        debug!(err = ?e, "Pipe was already closed by the unpack side");
    }

    result
}

async fn stream_chunks(ctx: &PullContext, writer: &mut DuplexStream) -> Result<()> {
    for index in 0..ctx.total_chunks {
        // Wait for this chunk's download to finish, or for the pipeline to fail
        let waited = ctx
            .state
            .wait_until(|inner| {
                if let Some(failure) = &inner.failure {
                    return Some(Err(Arc::clone(failure)));
                }

                let record = &inner.chunks[index];
                record.completed.then(|| Ok(record.file_path.clone()))
            })
            .await;

        let spool_path = match waited {
            Ok(Some(spool_path)) => spool_path,
            Ok(None) => panic!("BUG: chunk {index} completed without a spool file"),
            Err(failure) => {
                debug!(chunk = index, "Stopping chunk streaming after pipeline failure");

                return Err(PullTarError::shared(failure));
            }
        };

        debug!(chunk = index, path = %spool_path.display(), "Streaming chunk into unpack pipeline");

        copy_spool_to_pipe(&spool_path, writer, ctx.state.cancel_token()).await?;

        // The chunk's bytes are all in the pipe; delete the spool file, and only then give the
        // on-disk slot back
        tokio::fs::remove_file(&spool_path)
            .await
            .with_context(|_| error::DeleteChunkFileSnafu {
                path: spool_path.clone(),
            })?;

        ctx.state.update(|inner| {
            inner.chunks[index].file_path = None;
            inner.chunks_on_disk -= 1;
        });
    }

    debug!("All chunks streamed");

    Ok(())
}

/// Copy one spool file into the pipe, bailing out if the pipeline is cancelled mid-copy.
async fn copy_spool_to_pipe(
    spool_path: &Path,
    writer: &mut DuplexStream,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut spool_file =
        tokio::fs::File::open(spool_path)
            .await
            .with_context(|_| error::StreamChunkFileSnafu {
                path: spool_path.to_path_buf(),
            })?;

    tokio::select! {
        _ = cancel.cancelled() => error::AbortedSnafu {}.fail(),
        result = tokio::io::copy(&mut spool_file, writer) => {
            result
                .map(|_| ())
                .with_context(|_| error::StreamChunkFileSnafu {
                    path: spool_path.to_path_buf(),
                })
        }
    }
}

/// Delete whatever spool files are still registered in the chunk records.
async fn cleanup_chunks(records: Vec<ChunkRecord>) {
    for (index, record) in records.into_iter().enumerate() {
        if let Some(error) = &record.error {
            debug!(chunk = index, err = ?error, "Chunk download had failed");
        }

        if let Some(path) = record.file_path {
            remove_spool_file(&path).await;
        }
    }
}

/// Best-effort deletion of a spool file during cleanup.
async fn remove_spool_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), err = ?e, "Couldn't delete chunk spool file");
    }
}
