//! Integration tests exercising the whole pull pipeline, from remote archive bytes to extracted
//! files on disk.
//!
//! The in-memory tests drive the pipeline from [`crate::source::InMemorySource`], so they can run
//! on any dev system.  The minio tests additionally exercise the real S3 downloader against a
//! local [minio](https://min.io) server, which obviously assumes that minio is installed on the
//! local system; they are marked `ignore` so that they must be explicitly invoked.

mod in_memory;
mod minio;
