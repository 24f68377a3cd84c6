use super::{resolve_target, Outcome, Probe, ProbeError, ProbeKind};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;
use trust_dns_resolver::config::{NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsTransport {
    Udp,
    Tcp,
}

impl DnsTransport {
    fn protocol(self) -> Protocol {
        match self {
            DnsTransport::Udp => Protocol::Udp,
            DnsTransport::Tcp => Protocol::Tcp,
        }
    }
}

impl std::fmt::Display for DnsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsTransport::Udp => write!(f, "udp"),
            DnsTransport::Tcp => write!(f, "tcp"),
        }
    }
}

/// DNS query probe pinned to one server and one transport.
///
/// Caching is disabled and a single attempt is made per query, so every
/// `send` puts exactly one query on the wire.
pub struct DnsQueryProbe {
    resolver: TokioAsyncResolver,
    transport: DnsTransport,
    query_name: String,
    label: String,
}

impl DnsQueryProbe {
    pub async fn new(
        server_host: &str,
        port: u16,
        transport: DnsTransport,
        query_name: &str,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let server = resolve_target(server_host, port).await?;

        if query_name.trim_end_matches('.').is_empty() {
            return Err(ProbeError::InvalidTarget {
                target: query_name.to_string(),
                reason: "query name is empty".to_string(),
            });
        }

        // from_ips_clear yields a UDP and a TCP entry per address; keep ours.
        let servers: Vec<_> =
            NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true)
                .into_inner()
                .into_iter()
                .filter(|ns| ns.protocol == transport.protocol())
                .collect();

        let config = ResolverConfig::from_parts(None, vec![], NameServerConfigGroup::from(servers));

        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        opts.cache_size = 0;
        opts.use_hosts_file = false;

        let fqdn = if query_name.ends_with('.') {
            query_name.to_string()
        } else {
            format!("{}.", query_name)
        };

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            transport,
            query_name: fqdn,
            label: format!("{} via {}/{}", query_name, server, transport),
        })
    }

    pub fn transport(&self) -> DnsTransport {
        self.transport
    }
}

#[async_trait::async_trait]
impl Probe for DnsQueryProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Dns(self.transport)
    }

    fn target(&self) -> &str {
        &self.label
    }

    async fn send(&self) -> Outcome {
        let start = Instant::now();
        let result = self.resolver.ipv4_lookup(self.query_name.as_str()).await;
        let elapsed = start.elapsed();

        match result {
            Ok(lookup) => {
                let answers = lookup.iter().count() as u64;
                if answers == 0 {
                    debug!(target = %self.label, "DNS answer carried no records");
                    return Outcome::failure(elapsed);
                }
                // Approximate payload: one A record per answer.
                Outcome::success(answers * 4, elapsed)
            }
            Err(e) => {
                debug!(target = %self.label, error = %e, "DNS query failed");
                Outcome::failure(elapsed)
            }
        }
    }
}
