use crate::{Config, Result};
use bytes::Bytes;
use dyn_clone::DynClone;
use futures::stream::BoxStream;
use url::Url;

mod s3;

/// A source of remote archive bytes, like S3.
///
/// The pull pipeline only ever needs two things from the storage holding the archive: the total
/// size of the archive object, and the bytes within a given range of it.  Abstracting those behind
/// a trait keeps the pipeline independent of any one storage technology, and lets tests drive it
/// from an in-memory source.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait ChunkDownloader: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Query the total size in bytes of the remote object at `path`.
    ///
    /// Fails if the object doesn't exist or its metadata can't be read.
    async fn object_size(&self, path: &str) -> Result<u64>;

    /// Download the byte range `start` to `end` of the remote object at `path`, as a stream of
    /// chunks of bytes.
    ///
    /// Both ends of the range are inclusive, matching HTTP `Range` header semantics, so the
    /// stream yields exactly `end - start + 1` bytes in total.
    async fn download_range(
        &self,
        path: &str,
        start: u64,
        end: u64,
    ) -> Result<BoxStream<'static, Result<Bytes>>>;
}

dyn_clone::clone_trait_object!(ChunkDownloader);

/// Construct the [`ChunkDownloader`] implementation which handles the object storage technology
/// `url` refers to.
///
/// The URL is expected to name the bucket (or equivalent namespace) the archive lives in; the
/// path within it is passed separately to the downloader methods.  If the URL isn't recognized as
/// being supported by pulltar, an error is returned.
pub async fn downloader_for_url(config: &Config, url: &Url) -> Result<Box<dyn ChunkDownloader>> {
    if url.scheme() == "s3" {
        Ok(Box::new(s3::S3ChunkDownloader::from_url(config.clone(), url).await?))
    } else {
        crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }.fail()
    }
}
