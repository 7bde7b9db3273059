//! End to end pull pipeline tests fed from an in-memory chunk source.
//!
//! The chunk size used here is deliberately tiny, so that even small fixture archives are split
//! into many chunks and the tests exercise the ordered reassembly of a concurrent download.
use crate::{progress::TestNotificationSink, source::InMemorySource, Result};
use assert_matches::assert_matches;
use more_asserts::*;
use pulltar::{DownloadRequest, PullJob, PullJobBuilder, PullTarError};
use pulltar_testing::{archive, logging, test_data};
use std::path::Path;

const SOURCE_PATH: &str = "backups";

fn config_for_test(spool_dir: &Path) -> pulltar::Config {
    let mut config = pulltar::Config::default();

    config.chunk_size = byte_unit::Byte::from_bytes(64 * 1024);
    config.temp_dir = Some(spool_dir.to_path_buf());

    config
}

async fn make_job(
    archive: Vec<u8>,
    filename: &str,
    destination: &Path,
    spool_dir: &Path,
) -> pulltar::Result<PullJob> {
    let source = InMemorySource::new(format!("{SOURCE_PATH}/{filename}"), archive);

    let request = DownloadRequest {
        source_path: SOURCE_PATH.to_string(),
        filename: filename.to_string(),
        destination: destination.to_path_buf(),
        chunk_size: None,
        correlation_id: filename.to_string(),
        message: format!("Downloading {filename}"),
    };

    PullJobBuilder::new(config_for_test(spool_dir), Box::new(source), request)
        .build()
        .await
}

async fn run_job(job: PullJob) -> (pulltar::Result<()>, TestNotificationSink) {
    let progress = TestNotificationSink::new();

    let result = job.run(futures::future::pending(), progress.clone()).await;

    progress.sanity_check_notifications();

    (result, progress)
}

/// Pulls must clean up after themselves whether they succeed or fail; chunk spool files left
/// behind in the spool dir are a bug.
#[track_caller]
fn assert_spool_dir_empty(spool_dir: &Path) {
    let leftovers = std::fs::read_dir(spool_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect::<Vec<_>>();

    assert!(
        leftovers.is_empty(),
        "chunk spool files were left behind: {leftovers:?}"
    );
}

fn fixture_files() -> Result<std::collections::HashMap<String, test_data::TestFileWithData>> {
    test_data::make_test_files(vec![
        test_data::TestFile::new("file1.bin", "128KiB"),
        test_data::TestFile::new("dir1/file2.bin", "300KiB"),
        test_data::TestFile::new("dir1/dir2/file3.txt", "512B"),
    ])
}

#[test]
fn plain_tar_spanning_many_chunks() -> Result<()> {
    logging::test_with_logging(async move {
        let fixture = tempfile::tempdir()?;
        let spool_dir = fixture.path().join("spool");
        std::fs::create_dir(&spool_dir)?;
        let destination = fixture.path().join("extracted");

        let test_data = fixture_files()?;
        let tar = archive::build_tar(&test_data)?;
        let tar_len = tar.len() as u64;

        let job = make_job(tar, "fixture.tar", &destination, &spool_dir).await?;

        assert_eq!(job.total_bytes(), tar_len);
        assert_gt!(
            job.total_chunks(),
            1,
            "the fixture archive must span several chunks"
        );

        let (result, progress) = run_job(job).await;
        result?;

        progress.assert_closed("fixture.tar");
        // Every extracted file gets its own progress lifecycle, correlated by destination path
        progress.assert_closed(&destination.join("dir1/file2.bin").display().to_string());

        test_data::validate_test_data_in_dir(
            &test_data,
            &destination,
            ["file1.bin", "dir1/file2.bin", "dir1/dir2/file3.txt"],
        )
        .await?;
        assert_spool_dir_empty(&spool_dir);

        Ok(())
    })
}

#[test]
fn tar_gz_spanning_many_chunks() -> Result<()> {
    logging::test_with_logging(async move {
        let fixture = tempfile::tempdir()?;
        let spool_dir = fixture.path().join("spool");
        std::fs::create_dir(&spool_dir)?;
        let destination = fixture.path().join("extracted");

        // The fixture contents are random, so the gzip layer doesn't shrink the archive below
        // the multi-chunk threshold
        let test_data = fixture_files()?;
        let tar_gz = archive::build_tar_gz(&test_data)?;

        let job = make_job(tar_gz, "fixture.tar.gz", &destination, &spool_dir).await?;

        assert_gt!(
            job.total_chunks(),
            1,
            "the fixture archive must span several chunks"
        );

        let (result, progress) = run_job(job).await;
        result?;

        progress.assert_closed("fixture.tar.gz");
        test_data::validate_test_data_in_dir(
            &test_data,
            &destination,
            ["file1.bin", "dir1/file2.bin", "dir1/dir2/file3.txt"],
        )
        .await?;
        assert_spool_dir_empty(&spool_dir);

        Ok(())
    })
}

#[test]
fn empty_tar_gz_extracts_to_empty_destination() -> Result<()> {
    logging::test_with_logging(async move {
        let fixture = tempfile::tempdir()?;
        let spool_dir = fixture.path().join("spool");
        std::fs::create_dir(&spool_dir)?;
        let destination = fixture.path().join("extracted");

        let test_data = test_data::make_test_files(vec![])?;
        let tar_gz = archive::build_tar_gz(&test_data)?;

        let job = make_job(tar_gz, "empty.tar.gz", &destination, &spool_dir).await?;
        let (result, progress) = run_job(job).await;
        result?;

        progress.assert_closed("empty.tar.gz");
        assert!(destination.is_dir());
        assert_eq!(std::fs::read_dir(&destination)?.count(), 0);
        assert_spool_dir_empty(&spool_dir);

        Ok(())
    })
}

/// A tar archive with no entries at all consists of nothing but zero padding, which doesn't
/// carry the `ustar` magic, so it's rejected as unrecognized rather than treated as an empty
/// archive.  Wrapping it in gzip (as in [`empty_tar_gz_extracts_to_empty_destination`]) is
/// what makes an empty archive recognizable.
#[test]
fn entryless_tar_is_all_zero_padding_and_unrecognized() -> Result<()> {
    logging::test_with_logging(async move {
        let fixture = tempfile::tempdir()?;
        let spool_dir = fixture.path().join("spool");
        std::fs::create_dir(&spool_dir)?;
        let destination = fixture.path().join("extracted");

        let test_data = test_data::make_test_files(vec![])?;
        let tar = archive::build_tar(&test_data)?;

        let job = make_job(tar, "empty.tar", &destination, &spool_dir).await?;
        let (result, _progress) = run_job(job).await;

        assert_matches!(result, Err(PullTarError::UnrecognizedFormat { .. }));
        assert!(
            !destination.exists(),
            "no destination should be created for input that was never recognized as an archive"
        );
        assert_spool_dir_empty(&spool_dir);

        Ok(())
    })
}

#[test]
fn unrecognized_input_leaves_no_spool_files() -> Result<()> {
    logging::test_with_logging(async move {
        let fixture = tempfile::tempdir()?;
        let spool_dir = fixture.path().join("spool");
        std::fs::create_dir(&spool_dir)?;
        let destination = fixture.path().join("extracted");

        // Definitely not gzip (wrong first byte) and definitely not tar (no `ustar` at offset
        // 257), but big enough that the download side has several chunks in flight when the
        // unpack side gives up
        let not_an_archive = vec![b'x'; 200 * 1024];

        let job = make_job(not_an_archive, "fixture.tar", &destination, &spool_dir).await?;
        let (result, _progress) = run_job(job).await;

        // The first failure wins the error latch, and with chunks still streaming that's a race
        // between the format sniffer rejecting the stream and the streamer hitting the pipe the
        // unpack side just closed; both stem from the same rejection
        assert_matches!(
            result,
            Err(PullTarError::UnrecognizedFormat { .. } | PullTarError::StreamChunkFile { .. })
        );
        assert!(!destination.exists());
        assert_spool_dir_empty(&spool_dir);

        Ok(())
    })
}
