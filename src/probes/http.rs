use super::{Outcome, Probe, ProbeError, ProbeKind};
use bytes::Bytes;
use reqwest::{Client, Url};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Build the HTTP(S) client shared by every HTTP probe of a test family.
///
/// When `ca_cert` points at a readable PEM certificate it is trusted as an
/// extra root; otherwise a plain client is returned so plain-HTTP families
/// keep working.
pub fn http_client(ca_cert: Option<&Path>, timeout: Duration) -> Result<Client, ProbeError> {
    let mut builder = Client::builder().timeout(timeout);

    if let Some(path) = ca_cert {
        match std::fs::read(path) {
            Ok(pem) => match reqwest::Certificate::from_pem(&pem) {
                Ok(cert) => {
                    debug!(path = %path.display(), "trusting custom CA certificate");
                    builder = builder.add_root_certificate(cert);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "CA certificate did not parse, using default trust store");
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "CA certificate not readable, using default trust store");
            }
        }
    }

    Ok(builder.build()?)
}

fn parse_http_url(url: &str) -> Result<Url, ProbeError> {
    let parsed = Url::parse(url).map_err(|e| ProbeError::InvalidTarget {
        target: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ProbeError::InvalidTarget {
                target: url.to_string(),
                reason: format!("unsupported scheme '{}'", other),
            })
        }
    }

    if parsed.host_str().is_none() {
        return Err(ProbeError::InvalidTarget {
            target: url.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(parsed)
}

/// HTTP GET probe: success means a 2xx status and a fully drained body.
pub struct HttpGetProbe {
    client: Client,
    url: Url,
    label: String,
}

impl HttpGetProbe {
    pub fn new(client: Client, url: &str) -> Result<Self, ProbeError> {
        let url = parse_http_url(url)?;
        Ok(Self {
            client,
            label: url.to_string(),
            url,
        })
    }
}

#[async_trait::async_trait]
impl Probe for HttpGetProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::HttpGet
    }

    fn target(&self) -> &str {
        &self.label
    }

    async fn send(&self) -> Outcome {
        let start = Instant::now();

        let mut resp = match self.client.get(self.url.clone()).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url = %self.label, error = %e, "GET failed");
                return Outcome::failure(start.elapsed());
            }
        };

        if !resp.status().is_success() {
            debug!(url = %self.label, status = resp.status().as_u16(), "GET returned non-success status");
            return Outcome::failure(start.elapsed());
        }

        let mut received = 0u64;
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => received += chunk.len() as u64,
                Ok(None) => break,
                Err(e) => {
                    debug!(url = %self.label, error = %e, "GET body interrupted");
                    return Outcome::failure(start.elapsed());
                }
            }
        }

        Outcome::success(received, start.elapsed())
    }
}

/// HTTP POST probe streaming a zero-filled payload as the request body.
pub struct HttpStreamPostProbe {
    client: Client,
    url: Url,
    label: String,
    payload_bytes: u64,
    chunk: Bytes,
}

impl HttpStreamPostProbe {
    pub fn new(
        client: Client,
        url: &str,
        payload_bytes: u64,
        chunk_bytes: usize,
    ) -> Result<Self, ProbeError> {
        let url = parse_http_url(url)?;
        if chunk_bytes == 0 {
            return Err(ProbeError::InvalidTarget {
                target: url.to_string(),
                reason: "chunk size must be non-zero".to_string(),
            });
        }

        Ok(Self {
            client,
            label: url.to_string(),
            url,
            payload_bytes,
            chunk: Bytes::from(vec![0u8; chunk_bytes]),
        })
    }

    fn body_chunks(&self) -> Vec<Result<Bytes, std::io::Error>> {
        let chunk_len = self.chunk.len() as u64;
        let full = self.payload_bytes / chunk_len;
        let rest = (self.payload_bytes % chunk_len) as usize;

        let mut chunks: Vec<Result<Bytes, std::io::Error>> =
            (0..full).map(|_| Ok(self.chunk.clone())).collect();
        if rest > 0 {
            chunks.push(Ok(self.chunk.slice(..rest)));
        }
        chunks
    }
}

#[async_trait::async_trait]
impl Probe for HttpStreamPostProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::HttpStreamPost
    }

    fn target(&self) -> &str {
        &self.label
    }

    async fn send(&self) -> Outcome {
        let body = reqwest::Body::wrap_stream(futures::stream::iter(self.body_chunks()));

        let start = Instant::now();
        let result = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, self.payload_bytes)
            .body(body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                Outcome::success(self.payload_bytes, start.elapsed())
            }
            Ok(resp) => {
                debug!(url = %self.label, status = resp.status().as_u16(), "POST returned non-success status");
                Outcome::failure(start.elapsed())
            }
            Err(e) => {
                debug!(url = %self.label, error = %e, "POST failed");
                Outcome::failure(start.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        http_client(None, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = HttpGetProbe::new(client(), "ftp://example.com/file").err().unwrap();
        assert!(matches!(err, ProbeError::InvalidTarget { .. }));
    }

    #[test]
    fn test_rejects_garbage_url() {
        assert!(HttpGetProbe::new(client(), "not a url").is_err());
    }

    #[test]
    fn test_accepts_http_and_https() {
        assert!(HttpGetProbe::new(client(), "http://127.0.0.1:8080/download/1000").is_ok());
        assert!(HttpGetProbe::new(client(), "https://localhost:8443/download/1000").is_ok());
    }

    #[test]
    fn test_post_rejects_zero_chunk() {
        let err = HttpStreamPostProbe::new(client(), "http://127.0.0.1/upload", 10, 0)
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::InvalidTarget { .. }));
    }

    #[test]
    fn test_post_body_chunks_cover_payload() {
        let probe = HttpStreamPostProbe::new(client(), "http://127.0.0.1/upload", 25, 10).unwrap();
        let sizes: Vec<usize> = probe
            .body_chunks()
            .into_iter()
            .map(|c| c.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_missing_ca_falls_back_to_plain_client() {
        let result = http_client(
            Some(Path::new("/nonexistent/ca.crt")),
            Duration::from_secs(1),
        );
        assert!(result.is_ok());
    }
}
