//! CPU/RAM sampling for the local process and for named processes.
//!
//! The OS-specific measurement lives behind [`ProcessStatProvider`]; the
//! [`sampler`] module turns it into point samples, continuous monitors and
//! the rate controller's local poller. Sampling never fails a test: any
//! provider error degrades to a zero-valued sample.

pub mod sampler;
pub mod system;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use sampler::{LocalPoll, MonitorHandle, ResourceSampler};
pub use system::SysinfoProvider;

/// Which process(es) a sample is taken for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessSelector {
    Pid(u32),
    /// Every process whose name contains this string.
    Name(String),
}

impl ProcessSelector {
    pub fn label(&self) -> String {
        match self {
            ProcessSelector::Pid(pid) => pid.to_string(),
            ProcessSelector::Name(name) => name.clone(),
        }
    }
}

/// One reading. All zeros means the process was not found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsageSample {
    pub process_name: String,
    /// Share of total host CPU, in `[0, 1]`.
    pub cpu_fraction: f64,
    pub ram_bytes: u64,
    pub process_count: u32,
}

impl ProcessUsageSample {
    pub fn not_found(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.process_count == 0 && self.ram_bytes == 0 && self.cpu_fraction == 0.0
    }
}

/// Per-process usage over a monitoring window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub average_cpu_fraction: f64,
    /// Largest RAM reading seen, not the mean.
    pub peak_ram_bytes: u64,
    pub process_count: u32,
    pub samples: u64,
}

pub type AggregatedProcessUsage = BTreeMap<String, ProcessUsage>;

/// Which processes a runner should sample alongside its traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTargets {
    pub pid: Option<u32>,
    pub process_names: Vec<String>,
}

impl ResourceTargets {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pid.is_none() && self.process_names.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("process {0} not found")]
    NotFound(String),

    #[error("resource inspection unavailable: {0}")]
    Unavailable(String),
}

/// OS-specific CPU/RAM inspection.
///
/// Implementations are called from the blocking thread pool and may block.
pub trait ProcessStatProvider: Send + Sync + 'static {
    fn sample(&self, selector: &ProcessSelector) -> Result<ProcessUsageSample, SamplingError>;
}
