//! An in-memory implementation of [`pulltar::ChunkDownloader`], so the pull pipeline can be
//! driven end to end without any object storage behind it.
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use pulltar::ChunkDownloader;

/// Chunk source serving a single in-memory object under a fixed remote path.
#[derive(Clone, Debug)]
pub struct InMemorySource {
    path: String,
    content: Bytes,
}

impl InMemorySource {
    pub fn new(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[async_trait::async_trait]
impl ChunkDownloader for InMemorySource {
    async fn object_size(&self, path: &str) -> pulltar::Result<u64> {
        assert_eq!(
            path, self.path,
            "the pipeline asked for an object this test source doesn't serve"
        );

        Ok(self.content.len() as u64)
    }

    async fn download_range(
        &self,
        path: &str,
        start: u64,
        end: u64,
    ) -> pulltar::Result<BoxStream<'static, pulltar::Result<Bytes>>> {
        assert_eq!(
            path, self.path,
            "the pipeline asked for an object this test source doesn't serve"
        );

        let chunk = self.content.slice(start as usize..=end as usize);

        Ok(futures::stream::iter([Ok(chunk)]).boxed())
    }
}
