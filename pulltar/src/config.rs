use std::path::PathBuf;
use url::Url;

/// The configuration settings that control the behavior of archive download and extraction.
///
///
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Send S3 API calls to a custom endpoint instead of AWS.
    ///
    /// Set this to work against an S3-compatible service like Minio.  When an endpoint is set,
    /// the AWS region is ignored.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS region in which the S3 bucket is located.
    ///
    /// If not set, the region is taken from the standard AWS environment variables and config
    /// files, falling back to `us-east-1`.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "REGION"))]
    pub aws_region: Option<String>,

    /// The AWS access key ID to authenticate to S3 with.
    ///
    /// If this and `aws_secret_access_key` are not both set, credentials are resolved the way the
    /// AWS CLI resolves them, from the environment, config files, or instance metadata.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "KEY_ID"))]
    pub aws_access_key_id: Option<String>,

    /// The AWS secret access key that goes with `aws_access_key_id`.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "SECRET"))]
    pub aws_secret_access_key: Option<String>,

    /// The session token to use when the access key is a temporary credential.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "TOKEN"))]
    pub aws_session_token: Option<String>,

    /// The size of the chunks the remote archive is split into for download.
    ///
    /// Each chunk is downloaded with a separate ranged request and spooled to a temporary file
    /// before it's fed to the unpack pipeline, so this also bounds how much disk space a single
    /// chunk occupies.
    ///
    /// Accepts plain byte counts like "1000000" as well as suffixed sizes like "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "100MiB", global = true))]
    pub chunk_size: byte_unit::Byte,

    /// The maximum number of chunks downloaded concurrently.
    ///
    /// A higher number of concurrent downloads may be necessary in order to saturate very fast
    /// connections to S3, but this will also increase RAM and disk usage during the transfer.
    #[cfg_attr(feature = "clap", clap(long, default_value = "6", global = true))]
    pub worker_count: usize,

    /// The maximum number of downloaded chunks allowed to sit on disk waiting to be unpacked.
    ///
    /// The unpack side of the pipeline consumes chunks strictly in order, so a slow extraction can
    /// otherwise let completed downloads pile up.  Once this many chunks are waiting on disk, no
    /// new chunk downloads are started until the oldest chunk has been unpacked and deleted.
    #[cfg_attr(feature = "clap", clap(long, default_value = "40", global = true))]
    pub max_chunks_on_disk: usize,

    /// The size of the in-memory buffer each download worker accumulates response data into
    /// before flushing it to the chunk spool file.
    ///
    /// Accepts plain byte counts like "1000000" as well as suffixed sizes like "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "6MiB", global = true))]
    pub download_buffer_size: byte_unit::Byte,

    /// The directory where chunk spool files are written.
    ///
    /// If not set, the system temp directory is used.  Whatever directory is used needs enough
    /// free space to hold `max_chunks_on_disk` chunks of `chunk_size` bytes each.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "PATH"))]
    pub temp_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: these defaults repeat the values declared in the `clap` attributes.  There's no
        // way to share them short of making `clap` a mandatory dependency of the lib crate,
        // which it shouldn't be
        Self {
            s3_endpoint: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_session_token: None,
            chunk_size: byte_unit::Byte::from_bytes(100 * 1024 * 1024),
            worker_count: 6,
            max_chunks_on_disk: 40,
            download_buffer_size: byte_unit::Byte::from_bytes(6 * 1024 * 1024),
            temp_dir: None,
        }
    }
}
