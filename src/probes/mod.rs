//! Probes: one unit of network work whose success and size/time are observable.
//!
//! Every probe is validated at construction and is safe to share behind an
//! `Arc` across many concurrently running tasks. A probe never retries and
//! never surfaces per-call errors; failures are folded into the [`Outcome`].

use std::time::Duration;

use thiserror::Error;

pub mod dns;
pub mod http;
pub mod udp_echo;

pub use dns::{DnsQueryProbe, DnsTransport};
pub use http::{http_client, HttpGetProbe, HttpStreamPostProbe};
pub use udp_echo::UdpEchoProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    HttpGet,
    HttpStreamPost,
    Dns(DnsTransport),
    UdpEcho,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::HttpGet => write!(f, "http-get"),
            ProbeKind::HttpStreamPost => write!(f, "http-post"),
            ProbeKind::Dns(transport) => write!(f, "dns-{}", transport),
            ProbeKind::UdpEcho => write!(f, "udp-echo"),
        }
    }
}

/// Result of a single [`Probe::send`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub bytes_moved: u64,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn success(bytes_moved: u64, elapsed: Duration) -> Self {
        Self {
            success: true,
            bytes_moved,
            elapsed,
        }
    }

    pub fn failure(elapsed: Duration) -> Self {
        Self {
            success: false,
            bytes_moved: 0,
            elapsed,
        }
    }
}

/// Raised while building a probe, before any traffic is sent.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("could not resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Trait for all load probes.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> ProbeKind;

    /// Human-readable target (URL or `host:port`), used in logs.
    fn target(&self) -> &str;

    /// Send one unit of work and report what happened.
    async fn send(&self) -> Outcome;
}

/// Resolve `host:port` to the first socket address, failing fast when the
/// target is malformed or unknown.
pub(crate) async fn resolve_target(
    host: &str,
    port: u16,
) -> Result<std::net::SocketAddr, ProbeError> {
    let target = format!("{}:{}", host, port);
    if host.is_empty() {
        return Err(ProbeError::InvalidTarget {
            target,
            reason: "host is empty".to_string(),
        });
    }
    if port == 0 {
        return Err(ProbeError::InvalidTarget {
            target,
            reason: "port must be non-zero".to_string(),
        });
    }

    let mut addrs = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|source| ProbeError::Resolve {
            target: target.clone(),
            source,
        })?;

    addrs.next().ok_or_else(|| ProbeError::InvalidTarget {
        target: target.clone(),
        reason: "host resolved to no addresses".to_string(),
    })
}
