//! Tests that exercise the real S3 downloader against a live object store, using a local
//! [minio](https://min.io) server for greater convenience and zero cost.
//!
//! Everything the in-memory tests verify about the pipeline holds here too; what these add is
//! the actual S3 client, ranged `GetObject` requests included.  They assume a `minio` binary is
//! installed on the local system (or named by the `MINIO_PATH` env var), which not every dev
//! system has, so they are `ignore`d by default and must be invoked explicitly with
//! `cargo test -- --ignored`.
use crate::{progress::TestNotificationSink, Result};
use assert_matches::assert_matches;
use more_asserts::*;
use pulltar::{downloader_for_url, DownloadRequest, PullJobBuilder, PullTarError};
use pulltar_testing::{archive, logging, minio, test_data};
use std::path::Path;

/// Set up the pulltar config to use the specified Minio server
fn config_for_minio(server: &minio::MinioServer, spool_dir: &Path) -> pulltar::Config {
    let mut config = pulltar::Config::default();

    config.aws_region = Some("us-east-1".to_string());
    config.aws_access_key_id = Some("minioadmin".to_string());
    config.aws_secret_access_key = Some("minioadmin".to_string());
    config.s3_endpoint = Some(server.endpoint_url());

    // Tiny chunks so even small fixture archives make for a multi-chunk download
    config.chunk_size = byte_unit::Byte::from_bytes(64 * 1024);
    config.temp_dir = Some(spool_dir.to_path_buf());

    config
}

fn request_for(filename: &str, destination: &Path) -> DownloadRequest {
    DownloadRequest {
        source_path: "backups".to_string(),
        filename: filename.to_string(),
        destination: destination.to_path_buf(),
        chunk_size: None,
        correlation_id: filename.to_string(),
        message: format!("Downloading {filename}"),
    }
}

#[test]
#[ignore = "requires a local minio install"]
fn tar_archive_in_bucket() -> Result<()> {
    logging::test_with_logging(async move {
        let server = minio::MinioServer::get().await?;
        let bucket = server.create_bucket("tar-archive-in-bucket").await?;
        let client = server.aws_client().await?;

        let test_data = test_data::make_test_files(vec![
            test_data::TestFile::new("vm/disk0.img", "256KiB"),
            test_data::TestFile::new("vm/metadata.json", "1KiB"),
        ])?;
        let tar = archive::build_tar(&test_data)?;
        let url = test_data::upload_archive(&client, &bucket, "backups/test.tar", tar).await?;

        let fixture = tempfile::tempdir()?;
        let spool_dir = fixture.path().join("spool");
        std::fs::create_dir(&spool_dir)?;
        let destination = fixture.path().join("extracted");

        let config = config_for_minio(&server, &spool_dir);
        let downloader = downloader_for_url(&config, &url).await?;

        let job = PullJobBuilder::new(config, downloader, request_for("test.tar", &destination))
            .build()
            .await?;
        assert_gt!(
            job.total_chunks(),
            1,
            "the fixture archive must span several chunks"
        );

        let progress = TestNotificationSink::new();
        job.run(futures::future::pending(), progress.clone())
            .await?;

        progress.sanity_check_notifications();
        progress.assert_closed("test.tar");

        test_data::validate_test_data_in_dir(
            &test_data,
            &destination,
            ["vm/disk0.img", "vm/metadata.json"],
        )
        .await?;

        Ok(())
    })
}

#[test]
#[ignore = "requires a local minio install"]
fn tar_gz_archive_in_bucket() -> Result<()> {
    logging::test_with_logging(async move {
        let server = minio::MinioServer::get().await?;
        let bucket = server.create_bucket("tar-gz-archive-in-bucket").await?;
        let client = server.aws_client().await?;

        let test_data = test_data::make_test_files(vec![
            test_data::TestFile::new("vm/disk0.img", "256KiB"),
            test_data::TestFile::new("vm/metadata.json", "1KiB"),
        ])?;
        let tar_gz = archive::build_tar_gz(&test_data)?;
        let url =
            test_data::upload_archive(&client, &bucket, "backups/test.tar.gz", tar_gz).await?;

        let fixture = tempfile::tempdir()?;
        let spool_dir = fixture.path().join("spool");
        std::fs::create_dir(&spool_dir)?;
        let destination = fixture.path().join("extracted");

        let config = config_for_minio(&server, &spool_dir);
        let downloader = downloader_for_url(&config, &url).await?;

        let job =
            PullJobBuilder::new(config, downloader, request_for("test.tar.gz", &destination))
                .build()
                .await?;

        let progress = TestNotificationSink::new();
        job.run(futures::future::pending(), progress.clone())
            .await?;

        progress.sanity_check_notifications();
        progress.assert_closed("test.tar.gz");

        test_data::validate_test_data_in_dir(
            &test_data,
            &destination,
            ["vm/disk0.img", "vm/metadata.json"],
        )
        .await?;

        Ok(())
    })
}

#[test]
#[ignore = "requires a local minio install"]
fn missing_archive_fails_the_size_query() -> Result<()> {
    logging::test_with_logging(async move {
        let server = minio::MinioServer::get().await?;
        let bucket = server.create_bucket("missing-archive").await?;

        let fixture = tempfile::tempdir()?;
        let spool_dir = fixture.path().join("spool");
        std::fs::create_dir(&spool_dir)?;
        let destination = fixture.path().join("extracted");

        let config = config_for_minio(&server, &spool_dir);
        let url = format!("s3://{bucket}/backups/nope.tar").parse()?;
        let downloader = downloader_for_url(&config, &url).await?;

        // The size query runs at build time, so a missing archive fails before any chunk work
        let result = PullJobBuilder::new(config, downloader, request_for("nope.tar", &destination))
            .build()
            .await;

        assert_matches!(result, Err(PullTarError::HeadObject { .. }));
        assert!(!destination.exists());

        Ok(())
    })
}
