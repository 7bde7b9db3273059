//! Integration tests for extraction of archives that already sit on the local filesystem.
//!
//! The format of a local archive is detected from its content exactly as it is for pulled
//! archives; the file's name plays no part in it.
use crate::{progress::TestNotificationSink, Result};
use assert_matches::assert_matches;
use pulltar::{extract_archive_file, PullTarError};
use pulltar_testing::{archive, logging, test_data};

#[test]
fn local_tar_file_extracts_and_validates() -> Result<()> {
    logging::test_with_logging(async move {
        let fixture = tempfile::tempdir()?;
        let destination = fixture.path().join("extracted");

        let test_data = test_data::make_test_files(vec![
            test_data::TestFile::new("etc/config.yaml", "4KiB"),
            test_data::TestFile::new("data/blob.bin", "96KiB"),
        ])?;
        let tar = archive::build_tar(&test_data)?;

        // The extension is deliberately meaningless; only the content decides the format
        let archive_path = fixture.path().join("archive.bin");
        tokio::fs::write(&archive_path, tar).await?;

        let progress = TestNotificationSink::new();
        extract_archive_file(&archive_path, &destination, progress.clone()).await?;

        progress.sanity_check_notifications();
        progress.assert_closed(&destination.join("data/blob.bin").display().to_string());

        test_data::validate_test_data_in_dir(
            &test_data,
            &destination,
            ["etc/config.yaml", "data/blob.bin"],
        )
        .await?;

        Ok(())
    })
}

#[test]
fn local_tar_gz_file_extracts_and_validates() -> Result<()> {
    logging::test_with_logging(async move {
        let fixture = tempfile::tempdir()?;
        let destination = fixture.path().join("extracted");

        let test_data = test_data::make_test_files(vec![
            test_data::TestFile::new("etc/config.yaml", "4KiB"),
            test_data::TestFile::new("data/blob.bin", "96KiB"),
        ])?;
        let tar_gz = archive::build_tar_gz(&test_data)?;

        let archive_path = fixture.path().join("archive.bin");
        tokio::fs::write(&archive_path, tar_gz).await?;

        let progress = TestNotificationSink::new();
        extract_archive_file(&archive_path, &destination, progress.clone()).await?;

        progress.sanity_check_notifications();

        test_data::validate_test_data_in_dir(
            &test_data,
            &destination,
            ["etc/config.yaml", "data/blob.bin"],
        )
        .await?;

        Ok(())
    })
}

#[test]
fn local_file_of_unknown_format_is_rejected() -> Result<()> {
    logging::test_with_logging(async move {
        let fixture = tempfile::tempdir()?;
        let destination = fixture.path().join("extracted");

        let archive_path = fixture.path().join("archive.tar");
        tokio::fs::write(&archive_path, vec![b'x'; 4096]).await?;

        let progress = TestNotificationSink::new();
        let result = extract_archive_file(&archive_path, &destination, progress).await;

        assert_matches!(result, Err(PullTarError::UnrecognizedFormat { .. }));
        assert!(
            !destination.exists(),
            "no destination should be created for a file that was never recognized as an archive"
        );

        Ok(())
    })
}
