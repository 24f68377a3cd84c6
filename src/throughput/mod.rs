//! Bulk transfer measurement: half-duplex (download, then upload) and
//! full-duplex (both at once) over a pluggable [`TransferTransport`].

pub mod multipart;
pub mod report;
pub mod runner;
pub mod transport;

use crate::resources::{AggregatedProcessUsage, ProcessUsageSample};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use runner::ThroughputRunner;
pub use transport::{HttpTransport, TransferTransport, UploadBody};

/// Default bytes moved per direction.
pub const DEFAULT_TOTAL_BYTES: u64 = 100_000_000;
/// Default read buffer and write chunk size.
pub const DEFAULT_CHUNK_BYTES: usize = 10_000_000;

#[derive(Debug, Error)]
pub enum ThroughputError {
    #[error("invalid throughput settings: {0}")]
    InvalidSettings(String),

    #[error("invalid base url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("http transfer failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transfer i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{direction} transfer did not finish within {after:?}")]
    Timeout { direction: Direction, after: Duration },

    #[error("{direction} transfer task failed: {reason}")]
    TaskFailed { direction: Direction, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "RX")]
    Rx,
    #[serde(rename = "TX")]
    Tx,
    #[serde(rename = "RX-full-duplex")]
    RxFullDuplex,
    #[serde(rename = "TX-full-duplex")]
    TxFullDuplex,
}

impl Direction {
    pub fn is_download(self) -> bool {
        matches!(self, Direction::Rx | Direction::RxFullDuplex)
    }

    pub fn is_full_duplex(self) -> bool {
        matches!(self, Direction::RxFullDuplex | Direction::TxFullDuplex)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Rx => "RX",
            Direction::Tx => "TX",
            Direction::RxFullDuplex => "RX-full-duplex",
            Direction::TxFullDuplex => "TX-full-duplex",
        })
    }
}

/// Outcome of one transfer direction.
#[derive(Debug, Clone)]
pub struct ThroughputResult {
    pub direction: Direction,
    pub bytes_transferred: u64,
    pub duration: Duration,
    /// Local process snapshot taken right after the transfer.
    pub local: Option<ProcessUsageSample>,
    pub process_usage: Option<AggregatedProcessUsage>,
}

impl ThroughputResult {
    /// `bytes / (nanos / 1e9)`. Zero when no time was measured.
    pub fn bytes_per_second(&self) -> f64 {
        let nanos = self.duration.as_nanos() as f64;
        if nanos == 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / (nanos / 1e9)
    }

    pub fn bits_per_second(&self) -> f64 {
        self.bytes_per_second() * 8.0
    }
}

/// Tunables for a [`ThroughputRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputSettings {
    pub total_bytes: u64,
    pub chunk_bytes: usize,
    /// Upper bound on one direction; keeps full duplex from hanging.
    pub transfer_timeout: Duration,
    pub monitor_window: Duration,
    pub monitor_interval: Duration,
}

impl Default for ThroughputSettings {
    fn default() -> Self {
        Self {
            total_bytes: DEFAULT_TOTAL_BYTES,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            transfer_timeout: Duration::from_secs(120),
            monitor_window: Duration::from_secs(10),
            monitor_interval: Duration::from_millis(100),
        }
    }
}

impl ThroughputSettings {
    pub fn validate(&self) -> Result<(), ThroughputError> {
        if self.total_bytes == 0 {
            return Err(ThroughputError::InvalidSettings(
                "total_bytes must be non-zero".into(),
            ));
        }
        if self.chunk_bytes == 0 {
            return Err(ThroughputError::InvalidSettings(
                "chunk_bytes must be non-zero".into(),
            ));
        }
        if self.transfer_timeout.is_zero() {
            return Err(ThroughputError::InvalidSettings(
                "transfer_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
