use super::ChunkDownloader;
use crate::{error, Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::config::{Credentials, Region};
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

/// Implementation of [`ChunkDownloader`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3ChunkDownloader {
    inner: Arc<Inner>,
}

struct Inner {
    bucket: String,
    client: aws_sdk_s3::Client,
}

impl S3ChunkDownloader {
    /// Construct a downloader bound to the bucket in an `s3://bucket/...` URL.
    ///
    /// Only the bucket is taken from the URL; which object to download from the bucket is passed
    /// to the individual [`ChunkDownloader`] methods.
    pub(super) async fn from_url(config: Config, url: &Url) -> Result<Self> {
        // In `s3://bucket/path` the bucket lands in the URL's host position
        let bucket = url
            .host_str()
            .ok_or_else(|| error::MissingBucketSnafu { url: url.clone() }.build())?;

        Ok(Self {
            inner: Arc::new(Inner {
                bucket: bucket.to_string(),
                client: make_s3_client(&config).await,
            }),
        })
    }

    /// The path component of an `s3://bucket/prefix/object` URL carries a leading `/` that is
    /// not part of the object key; strip it.
    fn path_to_s3_key(path: &str) -> &str {
        if let Some(stripped) = path.strip_prefix('/') {
            stripped
        } else {
            path
        }
    }
}

#[async_trait::async_trait]
impl ChunkDownloader for S3ChunkDownloader {
    async fn object_size(&self, path: &str) -> Result<u64> {
        let key = Self::path_to_s3_key(path);

        debug!(bucket = %self.inner.bucket, key, "Querying object size");

        let metadata = self
            .inner
            .client
            .head_object()
            .bucket(&self.inner.bucket)
            .key(key)
            .send()
            .await
            .with_context(|_| error::HeadObjectSnafu {
                bucket: self.inner.bucket.clone(),
                key: key.to_string(),
            })?;

        let content_length = metadata
            .content_length()
            .filter(|size| *size >= 0)
            .with_context(|| error::MissingObjectSizeSnafu {
                bucket: self.inner.bucket.clone(),
                key: key.to_string(),
            })?;

        Ok(content_length as u64)
    }

    #[instrument(skip(self))]
    async fn download_range(
        &self,
        path: &str,
        start: u64,
        end: u64,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        debug!("Downloading object byte range");

        let key = Self::path_to_s3_key(path);

        let response = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.bucket)
            .key(key)
            .range(format!("bytes={start}-{end}"))
            .send()
            .await
            .with_context(|_| error::GetObjectSnafu {
                bucket: self.inner.bucket.clone(),
                key: key.to_string(),
                start,
                end,
            })?;

        // Adapt the SDK's `ByteStream` into a plain `futures` stream, attaching the object the
        // bytes came from to any read error
        let bucket = self.inner.bucket.clone();
        let key = key.to_string();
        let stream = futures::stream::try_unfold(response.body, move |mut body| {
            let bucket = bucket.clone();
            let key = key.clone();

            async move {
                let chunk = body
                    .try_next()
                    .await
                    .context(error::ReadByteStreamSnafu { bucket, key })?;

                Ok(chunk.map(|bytes| (bytes, body)))
            }
        });

        Ok(stream.boxed())
    }
}

impl std::fmt::Debug for S3ChunkDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ChunkDownloader")
            .field("bucket", &self.inner.bucket)
            .field("client", &"<...>")
            .finish()
    }
}

/// Create a new AWS SDK S3 client, honoring whatever region, credentials, and custom endpoint
/// are in the config, and deducing everything else from the environment the way the AWS CLI does
async fn make_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let region_provider = match &config.aws_region {
        Some(region) => RegionProviderChain::first_try(Region::new(region.clone())),
        None => RegionProviderChain::default_provider().or_else("us-east-1"),
    };

    let mut loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region_provider);

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        loader = loader.credentials_provider(Credentials::from_keys(
            access_key_id,
            secret_access_key,
            config.aws_session_token.clone(),
        ));
    }

    let aws_config = loader.load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // Custom S3-compatible endpoints like MinIO usually address buckets by path rather than
        // by virtual host name
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.to_string())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
