//! UDP echo probe, used for ping and jitter measurements.

use super::{resolve_target, Outcome, Probe, ProbeError, ProbeKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::debug;

const TAG_LEN: usize = 8;
const MAX_DATAGRAM: usize = 65_507;

/// Sends a tagged datagram and waits for the identical datagram to come back.
///
/// Every send binds its own ephemeral socket, so concurrent sends never read
/// each other's echoes.
pub struct UdpEchoProbe {
    target: SocketAddr,
    label: String,
    payload_bytes: usize,
    timeout: Duration,
    sequence: AtomicU64,
}

impl UdpEchoProbe {
    pub async fn new(
        host: &str,
        port: u16,
        payload_bytes: usize,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let target = resolve_target(host, port).await?;

        if payload_bytes > MAX_DATAGRAM {
            return Err(ProbeError::InvalidTarget {
                target: target.to_string(),
                reason: format!("payload of {} bytes exceeds a UDP datagram", payload_bytes),
            });
        }

        Ok(Self {
            target,
            label: target.to_string(),
            payload_bytes: payload_bytes.max(TAG_LEN),
            timeout,
            sequence: AtomicU64::new(0),
        })
    }

    /// Measure one round trip. Errors cover socket failures, timeouts and
    /// mismatched echoes.
    pub async fn round_trip(&self) -> std::io::Result<Duration> {
        let bind_addr: SocketAddr = if self.target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.target).await?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut payload = vec![0u8; self.payload_bytes];
        payload[..TAG_LEN].copy_from_slice(&seq.to_be_bytes());

        let mut buf = vec![0u8; self.payload_bytes + 1];

        let start = Instant::now();
        socket.send(&payload).await?;

        let deadline = start + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let len = tokio::time::timeout(remaining, socket.recv(&mut buf))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "echo timed out")
                })??;

            if buf[..len] == payload[..] {
                return Ok(start.elapsed());
            }
            // A stale echo from an earlier sequence; keep waiting.
            debug!(target = %self.label, len, "discarding mismatched echo");
        }
    }
}

#[async_trait::async_trait]
impl Probe for UdpEchoProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::UdpEcho
    }

    fn target(&self) -> &str {
        &self.label
    }

    async fn send(&self) -> Outcome {
        let start = Instant::now();
        match self.round_trip().await {
            Ok(rtt) => Outcome::success(self.payload_bytes as u64 * 2, rtt),
            Err(e) => {
                debug!(target = %self.label, error = %e, "UDP echo failed");
                Outcome::failure(start.elapsed())
            }
        }
    }
}
