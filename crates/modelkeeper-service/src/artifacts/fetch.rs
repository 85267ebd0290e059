use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::ArtifactError;
use crate::metric;

/// Retrieves artifact contents from their source.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync + 'static {
    /// Writes the contents at `url` into `destination`, returning the number of bytes written.
    async fn fetch(&self, url: &str, destination: &mut tokio::fs::File)
    -> Result<u64, ArtifactError>;
}

/// Downloads artifacts over HTTP(S), streaming the body to disk.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, ArtifactError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("modelkeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        destination: &mut tokio::fs::File,
    ) -> Result<u64, ArtifactError> {
        let started = Instant::now();
        let response = self.client.get(url).send().await?.error_for_status()?;

        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            destination.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        destination.flush().await?;

        metric!(timer("artifacts.download.duration") = started.elapsed());
        metric!(time_raw("artifacts.download.size") = written);
        tracing::debug!("Downloaded {written} bytes from {url}");
        Ok(written)
    }
}
