//! Ping and jitter over sequential UDP echo round trips.

use crate::probes::UdpEchoProbe;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LatencyError {
    #[error("sample count must be at least 1")]
    InvalidSampleCount,

    #[error("sample count {0} is too large")]
    SampleCountTooLarge(u32),

    #[error("no usable round trips out of {attempted} attempts")]
    NoSamples { attempted: u32 },
}

/// Anything that can time one request/response exchange.
#[async_trait::async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self) -> std::io::Result<Duration>;
}

#[async_trait::async_trait]
impl RoundTrip for UdpEchoProbe {
    async fn round_trip(&self) -> std::io::Result<Duration> {
        UdpEchoProbe::round_trip(self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyKind {
    Ping,
    Jitter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyResult {
    pub kind: LatencyKind,
    pub average: Duration,
    /// Round trips (ping) or differences (jitter) that went into the average.
    pub measured: u32,
    pub lost: u32,
}

impl LatencyResult {
    pub fn average_ms(&self) -> f64 {
        self.average.as_secs_f64() * 1000.0
    }
}

/// Average of `samples` sequential round trips. Lost echoes are skipped.
pub async fn ping(probe: &dyn RoundTrip, samples: u32) -> Result<LatencyResult, LatencyError> {
    if samples == 0 {
        return Err(LatencyError::InvalidSampleCount);
    }

    let rtts = collect(probe, samples).await;
    let ok: Vec<Duration> = rtts.iter().flatten().copied().collect();
    if ok.is_empty() {
        return Err(LatencyError::NoSamples { attempted: samples });
    }

    let average = mean(&ok);
    let result = LatencyResult {
        kind: LatencyKind::Ping,
        average,
        measured: ok.len() as u32,
        lost: samples - ok.len() as u32,
    };
    info!(average_ms = result.average_ms(), measured = result.measured, lost = result.lost, "ping complete");
    Ok(result)
}

/// Mean absolute difference between `differences + 1` consecutive round
/// trips. A difference is only counted when both neighbours came back.
pub async fn jitter(
    probe: &dyn RoundTrip,
    differences: u32,
) -> Result<LatencyResult, LatencyError> {
    if differences == 0 {
        return Err(LatencyError::InvalidSampleCount);
    }
    let attempts = differences
        .checked_add(1)
        .ok_or(LatencyError::SampleCountTooLarge(differences))?;

    let rtts = collect(probe, attempts).await;
    let diffs: Vec<Duration> = rtts
        .windows(2)
        .filter_map(|pair| match (pair[0], pair[1]) {
            (Some(a), Some(b)) => Some(if a > b { a - b } else { b - a }),
            _ => None,
        })
        .collect();

    if diffs.is_empty() {
        return Err(LatencyError::NoSamples {
            attempted: attempts,
        });
    }

    let result = LatencyResult {
        kind: LatencyKind::Jitter,
        average: mean(&diffs),
        measured: diffs.len() as u32,
        lost: differences - diffs.len() as u32,
    };
    info!(average_ms = result.average_ms(), measured = result.measured, lost = result.lost, "jitter complete");
    Ok(result)
}

async fn collect(probe: &dyn RoundTrip, count: u32) -> Vec<Option<Duration>> {
    let mut rtts = Vec::with_capacity(count as usize);
    for i in 0..count {
        match probe.round_trip().await {
            Ok(rtt) => rtts.push(Some(rtt)),
            Err(e) => {
                debug!(attempt = i, error = %e, "echo lost");
                rtts.push(None);
            }
        }
    }
    rtts
}

fn mean(values: &[Duration]) -> Duration {
    let total: Duration = values.iter().sum();
    total / values.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays a fixed script of round trips; `None` is a lost echo.
    struct Scripted {
        script: Mutex<std::vec::IntoIter<Option<u64>>>,
    }

    impl Scripted {
        fn new(millis: Vec<Option<u64>>) -> Self {
            Self {
                script: Mutex::new(millis.into_iter()),
            }
        }
    }

    #[async_trait::async_trait]
    impl RoundTrip for Scripted {
        async fn round_trip(&self) -> std::io::Result<Duration> {
            let next = self.script.lock().unwrap().next().flatten();
            next.map(Duration::from_millis).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "no echo")
            })
        }
    }

    #[tokio::test]
    async fn test_ping_averages() {
        let probe = Scripted::new(vec![Some(10), Some(20), Some(30)]);
        let r = ping(&probe, 3).await.unwrap();
        assert_eq!(r.average, Duration::from_millis(20));
        assert_eq!(r.measured, 3);
        assert_eq!(r.lost, 0);
        assert_eq!(r.average_ms(), 20.0);
    }

    #[tokio::test]
    async fn test_ping_skips_lost_echoes() {
        let probe = Scripted::new(vec![Some(10), None, Some(30)]);
        let r = ping(&probe, 3).await.unwrap();
        assert_eq!(r.average, Duration::from_millis(20));
        assert_eq!(r.lost, 1);
    }

    #[tokio::test]
    async fn test_jitter_uses_neighbour_differences() {
        // |10-14| + |14-11| + |11-19| = 4 + 3 + 8 = 15 over 3
        let probe = Scripted::new(vec![Some(10), Some(14), Some(11), Some(19)]);
        let r = jitter(&probe, 3).await.unwrap();
        assert_eq!(r.kind, LatencyKind::Jitter);
        assert_eq!(r.average, Duration::from_millis(5));
        assert_eq!(r.measured, 3);
    }

    #[tokio::test]
    async fn test_jitter_drops_pairs_with_a_loss() {
        let probe = Scripted::new(vec![Some(10), None, Some(11), Some(13)]);
        let r = jitter(&probe, 3).await.unwrap();
        assert_eq!(r.average, Duration::from_millis(2));
        assert_eq!(r.measured, 1);
        assert_eq!(r.lost, 2);
    }

    #[tokio::test]
    async fn test_all_lost_is_an_error() {
        let probe = Scripted::new(vec![None, None]);
        assert!(matches!(
            ping(&probe, 2).await,
            Err(LatencyError::NoSamples { attempted: 2 })
        ));
    }

    #[tokio::test]
    async fn test_zero_counts_rejected() {
        let probe = Scripted::new(vec![]);
        assert!(matches!(ping(&probe, 0).await, Err(LatencyError::InvalidSampleCount)));
        assert!(matches!(jitter(&probe, 0).await, Err(LatencyError::InvalidSampleCount)));
    }

    #[tokio::test]
    async fn test_jitter_rejects_count_without_room_for_extra_round_trip() {
        let probe = Scripted::new(vec![]);
        assert!(matches!(
            jitter(&probe, u32::MAX).await,
            Err(LatencyError::SampleCountTooLarge(u32::MAX))
        ));
    }

    #[tokio::test]
    async fn test_ping_over_real_udp_echo() {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..len], peer).await;
            }
        });

        let probe = UdpEchoProbe::new("127.0.0.1", port, 32, Duration::from_secs(1))
            .await
            .unwrap();
        let r = ping(&probe, 5).await.unwrap();
        assert_eq!(r.measured, 5);
        assert!(r.average < Duration::from_secs(1));
    }
}
