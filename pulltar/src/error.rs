use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

pub type Result<T, E = PullTarError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PullTarError {
    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("Error getting metadata about object '{key}' in S3 bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("The object '{key}' in S3 bucket '{bucket}' doesn't report a size"))]
    MissingObjectSize { bucket: String, key: String },

    #[snafu(display("Error downloading bytes {start}-{end} of object '{key}' in S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        start: u64,
        end: u64,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("Error reading the response body for object '{key}' in S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("Error creating a chunk spool file in '{}'", dir.display()))]
    CreateChunkFile {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error writing downloaded bytes to the chunk spool file '{}'", path.display()))]
    WriteChunkFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error streaming the chunk spool file '{}' into the unpack pipeline", path.display()))]
    StreamChunkFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error deleting the chunk spool file '{}'", path.display()))]
    DeleteChunkFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error opening the archive file '{}'", path.display()))]
    OpenArchiveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading the leading header bytes of the archive"))]
    ReadFormatHeader { source: std::io::Error },

    #[snafu(display("The file format was not recognized as either gzip or tar"))]
    UnrecognizedFormat {},

    #[snafu(display("Error creating the destination directory '{}'", path.display()))]
    CreateDestinationDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading the next entry from the tar archive"))]
    ReadArchiveEntry { source: std::io::Error },

    #[snafu(display("The archive entry '{name}' resolves to a path outside of the destination directory"))]
    EntryOutsideDestination { name: String },

    #[snafu(display("Error extracting the archive entry to '{}'", path.display()))]
    ExtractEntry {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error removing the rejected symlink '{}'", path.display()))]
    RemoveRejectedSymlink {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("The pull operation was aborted before it could finish"))]
    Aborted {},

    #[snafu(display("Error in spawned async task"))]
    Spawn { source: tokio::task::JoinError },

    #[snafu(display("Error in spawned blocking task"))]
    SpawnBlocking { source: tokio::task::JoinError },

    #[snafu(display("{source}"))]
    Shared { source: Arc<PullTarError> },
}

impl PullTarError {
    /// Re-wrap an error which has already been reported to the pipeline failure latch, so the
    /// same underlying failure can also be returned from the task which produced it.
    pub(crate) fn shared(source: Arc<PullTarError>) -> Self {
        Self::Shared { source }
    }
}
