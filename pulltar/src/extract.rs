//! The unpack side of the pipeline: archive streams in, files on disk come out.
//!
//! Everything here is deliberately synchronous.  Unpacking is a strictly sequential walk over
//! the tar entries with blocking filesystem writes, so it runs on a blocking thread (via
//! [`tokio::task::spawn_blocking`]) and reads from whatever `Read` impl feeds it, whether that's
//! a local file or the receiving end of the pull pipeline's pipe.
use crate::progress::{NotificationSink, ProgressNotification};
use crate::{error, format::ArchiveFormat, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use snafu::prelude::*;
use std::fs::OpenOptions;
use std::io::{Cursor, Read, Write};
use std::os::unix::fs::{symlink, DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tar::{Archive, EntryType};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Size of the copy buffer used when writing file entries out of the archive.
const COPY_BUF_LEN: usize = 1024;

/// Minimum time between two progress notifications about the same file.
const NOTIFY_INTERVAL: Duration = Duration::from_secs(1);

/// Mode the destination directory and any implicitly created parent directories get.
const IMPLICIT_DIR_MODE: u32 = 0o750;

/// Extract a local archive file into a directory.
///
/// The archive format (tar or tar.gz) is detected from the file's content; the file name plays
/// no part in it.  This is the local counterpart of the remote pull in [`crate::PullJob`]: the
/// same format detection, the same traversal and symlink rules, and the same per-file progress
/// notifications, but fed from a file that's already on disk.
pub async fn extract_archive_file(
    archive: impl Into<PathBuf>,
    destination: impl Into<PathBuf>,
    sink: impl NotificationSink + 'static,
) -> Result<()> {
    let archive = archive.into();
    let destination = destination.into();

    let span = info_span!("extract_archive_file",
        archive = %archive.display(),
        destination = %destination.display());

    async move {
        info!("Extracting local archive file");

        let result = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive)
                .with_context(|_| error::OpenArchiveFileSnafu {
                    path: archive.clone(),
                })?;

            unpack_stream(std::io::BufReader::new(file), &destination, &sink)
        })
        .await
        .context(error::SpawnBlockingSnafu)?;

        match &result {
            Ok(()) => {
                info!("Finished extracting local archive file");
            }
            Err(e) => {
                error!(err = ?e, "Extracting local archive file failed");
            }
        }

        result
    }
    .instrument(span)
    .await
}

/// Unpack an archive stream of unknown format into the destination directory.
///
/// The leading bytes of the stream are sniffed to decide between gzip-compressed and plain tar,
/// then stitched back onto the front of the stream before unpacking starts.
pub(crate) fn unpack_stream(
    mut reader: impl Read,
    destination: &Path,
    sink: &dyn NotificationSink,
) -> Result<()> {
    let mut header = [0u8; crate::format::HEADER_SNIFF_LEN];
    let header_len =
        read_header_prefix(&mut reader, &mut header).context(error::ReadFormatHeaderSnafu)?;

    let format = ArchiveFormat::detect(&header[..header_len])?;

    debug!(%format, header_len, "Detected archive format");

    let reader = Cursor::new(header[..header_len].to_vec()).chain(reader);

    let reader: Box<dyn Read + '_> = match format {
        ArchiveFormat::Tar => Box::new(reader),
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(reader)),
    };

    unpack_tar(reader, destination, sink)
}

/// Fill as much of `buf` as the reader can provide.
///
/// Unlike [`Read::read_exact`], a stream that ends before the buffer is full isn't an error;
/// archives smaller than the sniff window are still valid input.
fn read_header_prefix(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    Ok(filled)
}

/// Walk the entries of a tar stream and write them into the destination directory.
fn unpack_tar(
    reader: Box<dyn Read + '_>,
    destination: &Path,
    sink: &dyn NotificationSink,
) -> Result<()> {
    if !destination.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(IMPLICIT_DIR_MODE)
            .create(destination)
            .with_context(|_| error::CreateDestinationDirectorySnafu {
                path: destination.to_path_buf(),
            })?;
    }

    // Symlink containment below compares fully resolved paths, so resolve the destination once
    let canonical_destination =
        destination
            .canonicalize()
            .with_context(|_| error::CreateDestinationDirectorySnafu {
                path: destination.to_path_buf(),
            })?;

    let mut archive = Archive::new(reader);

    for entry in archive.entries().context(error::ReadArchiveEntrySnafu)? {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // The stream ran dry in the middle of an entry.  Whoever produced the stream is
                // responsible for reporting why; everything extracted so far stays extracted.
                warn!("Archive stream ended mid-entry; stopping extraction");
                break;
            }
            Err(e) => return Err(e).context(error::ReadArchiveEntrySnafu),
        };

        let dest_path = {
            let entry_path = entry.path().context(error::ReadArchiveEntrySnafu)?;
            sanitized_entry_path(destination, &entry_path)?
        };

        let entry_type = entry.header().entry_type();

        debug!(path = %dest_path.display(), ?entry_type, "Unpacking archive entry");

        match entry_type {
            EntryType::Directory => {
                let mode = entry.header().mode().context(error::ReadArchiveEntrySnafu)?;

                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(mode)
                    .create(&dest_path)
                    .with_context(|_| error::ExtractEntrySnafu {
                        path: dest_path.clone(),
                    })?;
            }
            EntryType::Regular | EntryType::GNUSparse => {
                write_entry_file(&mut entry, &dest_path, sink)?;
            }
            EntryType::Symlink => {
                extract_symlink(&entry, &dest_path, &canonical_destination)?;
            }
            other => {
                warn!(path = %dest_path.display(), entry_type = ?other,
                    "Skipping archive entry of unsupported type");
            }
        }
    }

    Ok(())
}

/// Resolve an archive entry name to its extraction path under the destination, lexically.
///
/// Entry names are untrusted input.  Root and `.` components are dropped, and `..` components
/// may only walk back within the entry's own sub-path; an entry whose name escapes the
/// destination that way fails the whole extraction.
fn sanitized_entry_path(destination: &Path, entry_path: &Path) -> Result<PathBuf> {
    let mut sanitized = destination.to_path_buf();
    let mut depth = 0usize;

    for component in entry_path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return error::EntryOutsideDestinationSnafu {
                        name: entry_path.display().to_string(),
                    }
                    .fail();
                }

                depth -= 1;
                sanitized.pop();
            }
            Component::Normal(part) => {
                depth += 1;
                sanitized.push(part);
            }
        }
    }

    Ok(sanitized)
}

/// Copy one regular file entry out of the archive, emitting throttled progress notifications.
///
/// Progress about a file is correlated by its destination path.  At most one notification per
/// second is emitted while the copy runs, plus always an opening one at 0% and a closing one at
/// 100% when the copy finishes.
fn write_entry_file<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    dest_path: &Path,
    sink: &dyn NotificationSink,
) -> Result<()> {
    let declared_size = entry.header().size().context(error::ReadArchiveEntrySnafu)?;
    let mode = entry.header().mode().context(error::ReadArchiveEntrySnafu)?;

    ensure_parent_dir(dest_path)?;

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(mode)
        .open(dest_path)
        .with_context(|_| error::ExtractEntrySnafu {
            path: dest_path.to_path_buf(),
        })?;

    let started_at = Utc::now();
    let correlation_id = dest_path.display().to_string();
    let message = format!("Extracting {}", dest_path.display());

    sink.notify(
        ProgressNotification::new(&correlation_id, &message, 0.0)
            .with_bytes(0, declared_size)
            .with_started_at(started_at),
    );

    let mut buf = [0u8; COPY_BUF_LEN];
    let mut copied = 0u64;
    let mut last_notified = Instant::now();

    loop {
        let read = entry.read(&mut buf).with_context(|_| error::ExtractEntrySnafu {
            path: dest_path.to_path_buf(),
        })?;

        if read == 0 {
            break;
        }

        file.write_all(&buf[..read])
            .with_context(|_| error::ExtractEntrySnafu {
                path: dest_path.to_path_buf(),
            })?;
        copied += read as u64;

        // Intermediate updates stay below 100%; only the closing notification reports completion
        if declared_size > 0 && copied < declared_size && last_notified.elapsed() >= NOTIFY_INTERVAL
        {
            last_notified = Instant::now();

            sink.notify(
                ProgressNotification::new(
                    &correlation_id,
                    &message,
                    copied as f64 / declared_size as f64 * 100.0,
                )
                .with_bytes(copied, declared_size)
                .with_started_at(started_at),
            );
        }
    }

    sink.notify(
        ProgressNotification::new(&correlation_id, &message, 100.0)
            .with_bytes(copied, declared_size)
            .with_started_at(started_at),
    );

    Ok(())
}

/// Extract a symlink entry, enforcing that whatever it points at stays inside the destination.
///
/// The stored link target is resolved relative to the destination root.  A target that can't be
/// resolved, or that resolves to somewhere outside the destination, gets the link deleted again
/// with a warning, and extraction carries on without it.  A target that resolves inside the
/// destination gets the link rewritten to the resolved path, so a link pointing at another link
/// comes out fully resolved.
fn extract_symlink<R: Read>(
    entry: &tar::Entry<'_, R>,
    dest_path: &Path,
    canonical_destination: &Path,
) -> Result<()> {
    let target = match entry.link_name().context(error::ReadArchiveEntrySnafu)? {
        Some(target) => target.into_owned(),
        None => {
            warn!(path = %dest_path.display(), "Skipping symlink entry without a target");
            return Ok(());
        }
    };

    ensure_parent_dir(dest_path)?;

    symlink(&target, dest_path).with_context(|_| error::ExtractEntrySnafu {
        path: dest_path.to_path_buf(),
    })?;

    // Absolute targets are rejected outright; joining would just take them as-is, so there's
    // nothing meaningful to resolve them against
    let resolved = if target.is_absolute() {
        None
    } else {
        canonical_destination.join(&target).canonicalize().ok()
    };

    let resolved = match resolved {
        Some(resolved) if resolved.starts_with(canonical_destination) => resolved,
        _ => {
            warn!(
                path = %dest_path.display(),
                target = %target.display(),
                "Removing symlink whose target is missing or outside the destination directory"
            );

            return std::fs::remove_file(dest_path).with_context(|_| {
                error::RemoveRejectedSymlinkSnafu {
                    path: dest_path.to_path_buf(),
                }
            });
        }
    };

    // Re-point the link at the resolved target, so chains of links inside the archive collapse
    // to direct links on disk
    std::fs::remove_file(dest_path).with_context(|_| error::ExtractEntrySnafu {
        path: dest_path.to_path_buf(),
    })?;
    symlink(&resolved, dest_path).with_context(|_| error::ExtractEntrySnafu {
        path: dest_path.to_path_buf(),
    })?;

    Ok(())
}

fn ensure_parent_dir(dest_path: &Path) -> Result<()> {
    if let Some(parent) = dest_path.parent() {
        if !parent.exists() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(IMPLICIT_DIR_MODE)
                .create(parent)
                .with_context(|_| error::ExtractEntrySnafu {
                    path: dest_path.to_path_buf(),
                })?;
        }
    }

    Ok(())
}
