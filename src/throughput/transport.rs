//! Where throughput bytes actually travel.

use super::ThroughputError;
use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Url};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A streamed request body of known length.
pub struct UploadBody {
    pub reader: BoxedReader,
    pub content_length: u64,
    pub content_type: String,
}

/// Moves bytes to and from a throughput endpoint.
#[async_trait::async_trait]
pub trait TransferTransport: Send + Sync {
    fn label(&self) -> &str;

    /// Ask the peer for `total_bytes` and return the body as a reader.
    async fn download(&self, total_bytes: u64) -> Result<BoxedReader, ThroughputError>;

    /// Stream `body` to the peer; resolves once the peer has answered.
    async fn upload(&self, body: UploadBody) -> Result<(), ThroughputError>;
}

/// HTTP(S) transport against `{base}/download/{n}` and `{base}/upload`.
pub struct HttpTransport {
    client: Client,
    base: String,
}

impl HttpTransport {
    pub fn new(client: Client, base_url: &str) -> Result<Self, ThroughputError> {
        let parsed = Url::parse(base_url).map_err(|e| ThroughputError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(ThroughputError::InvalidUrl {
                url: base_url.to_string(),
                reason: "expected http(s)://host[:port]".to_string(),
            });
        }
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn download_url(&self, total_bytes: u64) -> String {
        format!("{}/download/{}", self.base, total_bytes)
    }

    pub fn upload_url(&self) -> String {
        format!("{}/upload", self.base)
    }
}

#[async_trait::async_trait]
impl TransferTransport for HttpTransport {
    fn label(&self) -> &str {
        &self.base
    }

    async fn download(&self, total_bytes: u64) -> Result<BoxedReader, ThroughputError> {
        let url = self.download_url(total_bytes);
        debug!(%url, "requesting download");
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn upload(&self, body: UploadBody) -> Result<(), ThroughputError> {
        let url = self.upload_url();
        debug!(%url, content_length = body.content_length, "starting upload");
        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, body.content_type)
            .header(CONTENT_LENGTH, body.content_length)
            .body(Body::wrap_stream(ReaderStream::new(body.reader)))
            .send()
            .await?
            .error_for_status()?;
        // Drain so the connection can be reused.
        resp.bytes().await?;
        Ok(())
    }
}
