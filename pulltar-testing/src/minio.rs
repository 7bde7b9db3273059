//! Runs a throwaway `minio` process so the S3 integration tests have a real server to talk to.

use crate::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use which::which;

pub struct MinioServer {
    // Dropping the TempDir would pull the data dir out from under the running server
    #[allow(dead_code)]
    data_dir: TempDir,
    handle: Handle,
    endpoint: SocketAddr,
}

impl MinioServer {
    /// Get a handle to a shared minio instance, starting one if none is running.
    ///
    /// Tests that can share a server should call this instead of [`Self::start`].  Spawning
    /// minio is slow enough that paying the cost once per test run makes a difference.
    pub async fn get() -> Result<Arc<Self>> {
        // tokio's Mutex because the slot stays locked across the `start()` await
        static SHARED: Lazy<Mutex<Weak<MinioServer>>> = Lazy::new(|| Mutex::new(Weak::new()));

        let mut shared = SHARED.lock().await;

        let server = match shared.upgrade() {
            Some(server) => {
                debug!(endpoint = %server.endpoint, "reusing the running minio server");

                server
            }
            None => {
                let server = Arc::new(Self::start().await?);
                *shared = Arc::downgrade(&server);

                server
            }
        };

        // However we got it, make sure it still answers
        server.await_ready().await?;

        Ok(server)
    }

    /// Start a fresh minio server listening on a random local port.
    ///
    /// The binary comes from the `MINIO_PATH` env var when set, otherwise from `PATH`.
    pub async fn start() -> Result<Self> {
        let binary = Self::minio_binary()?;
        let endpoint = Self::reserve_listen_addr()?;
        let data_dir = Self::data_dir()?;

        let handle = duct::cmd!(
            binary,
            "server",
            data_dir.path(),
            "--address",
            endpoint.to_string(),
            "--quiet"
        )
        .start()?;

        let server = Self {
            data_dir,
            handle,
            endpoint,
        };

        debug!(endpoint = %server.endpoint, "waiting for minio to accept requests");

        server.await_ready().await?;

        debug!(endpoint = %server.endpoint, "minio is up");

        Ok(server)
    }

    /// URL of the server's S3 API endpoint.
    pub fn endpoint_url(&self) -> url::Url {
        format!("http://{}/", self.endpoint).parse().unwrap()
    }

    /// An [`aws_sdk_s3::Client`] pointed at this server.
    pub async fn aws_client(&self) -> Result<aws_sdk_s3::Client> {
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(RegionProviderChain::first_try("us-east-1"))
            .credentials_provider(Credentials::from_keys("minioadmin", "minioadmin", None))
            .load()
            .await;

        let config = aws_sdk_s3::config::Builder::from(&base)
            .endpoint_url(self.endpoint_url().to_string())
            // Minio serves every bucket on one host, so the bucket name has to go in the
            // request path rather than the hostname
            .force_path_style(true)
            .build();

        Ok(aws_sdk_s3::Client::from_conf(config))
    }

    /// Create a bucket for a test to use, returning its actual (randomized) name.
    ///
    /// The name is sanitized to S3's bucket naming rules and given a random prefix so
    /// concurrent tests stay out of each other's buckets.
    pub async fn create_bucket(&self, name: impl AsRef<str>) -> Result<String> {
        // Bucket names allow at most 63 chars from a restricted alphabet; squash anything
        // else to `-`
        static ILLEGAL: Lazy<Regex> = Lazy::new(|| Regex::new(r##"[^0-9a-zA-Z\.\-]+"##).unwrap());

        let sanitized = ILLEGAL.replace_all(name.as_ref(), "-");
        // Leave room for the 9 char prefix
        let sanitized = &sanitized[..sanitized.len().min(63 - 9)];
        let bucket = format!("{:08x}-{sanitized}", rand::thread_rng().next_u32());

        debug!(requested = name.as_ref(), %bucket, "creating test bucket");

        let client = self.aws_client().await?;

        client.create_bucket().bucket(bucket.clone()).send().await?;

        // CreateBucket can return before the bucket is usable; operations against it fail
        // claiming it doesn't exist.  Poll until HeadBucket stops failing.
        Self::retry_policy()
            .retry(|| client.head_bucket().bucket(&bucket).send())
            .await
            .map_err(|e| {
                eyre!("bucket {bucket} still isn't accessible after creating it; last error:\n{e}")
            })?;

        debug!(%bucket, "test bucket created");

        Ok(bucket)
    }

    /// Poll the server until it responds to S3 API calls.
    async fn await_ready(&self) -> Result<()> {
        let client = self.aws_client().await?;

        // Startup isn't instant, and on a loaded CI machine it can take a while
        Self::retry_policy()
            .retry(|| client.list_buckets().send())
            .await
            .map_err(|e| {
                eyre!(
                    "minio at {} never became ready; last ListBuckets error:\n{e}",
                    self.endpoint
                )
            })?;

        Ok(())
    }

    fn retry_policy() -> again::RetryPolicy {
        again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1))
    }

    fn minio_binary() -> Result<PathBuf> {
        std::env::var_os("MINIO_PATH")
            .map(PathBuf::from)
            .or_else(|| which("minio").ok())
            .ok_or_else(|| {
                eyre!("no minio binary found; set the MINIO_PATH env var or install minio in PATH")
            })
    }

    /// Find a free port on localhost for the server to listen on.
    ///
    /// The listener is dropped right away; minio binds the same address when it starts.
    fn reserve_listen_addr() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        Ok(addr)
    }

    /// Make a directory for minio's data under the home directory.
    ///
    /// Minio opens its storage with `O_DIRECT`, which tmpfs doesn't support, so `/tmp` (a
    /// tmpfs on most Linux setups) can't hold the data dir.
    fn data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("can't locate a home directory"))?;

        Ok(tempfile::tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "stopping minio");

        if let Err(e) = self.handle.kill() {
            eprintln!("failed to kill minio: {e}");
        }
    }
}
