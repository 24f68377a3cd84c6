//! Burst dispatcher: fire N probes at once and time the whole batch.

use super::{failure_rate, LoadError};
use crate::probes::Probe;
use crate::resources::{
    AggregatedProcessUsage, ProcessSelector, ProcessUsageSample, ResourceSampler,
    ResourceTargets,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Continuous process monitoring window for a burst, independent of how long
/// the burst itself takes.
pub const DEFAULT_MONITOR_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BurstResult {
    pub burst_size: usize,
    pub succeeded: u64,
    /// First dispatch to last completion.
    pub duration: Duration,
    pub failure_rate: f64,
    /// Single snapshot of the local PID taken while the burst was in flight.
    pub local: Option<ProcessUsageSample>,
    pub process_usage: Option<AggregatedProcessUsage>,
}

#[derive(Clone)]
pub struct BurstRunner {
    sampler: ResourceSampler,
    targets: ResourceTargets,
    monitor_window: Duration,
    monitor_interval: Duration,
}

impl BurstRunner {
    pub fn new(sampler: ResourceSampler, targets: ResourceTargets) -> Self {
        Self {
            sampler,
            targets,
            monitor_window: DEFAULT_MONITOR_WINDOW,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }

    pub fn with_monitor_window(mut self, window: Duration, interval: Duration) -> Self {
        self.monitor_window = window;
        self.monitor_interval = interval;
        self
    }

    /// Dispatch exactly `burst_size` probes concurrently, each in its own
    /// task, and wait for all of them.
    pub async fn run_burst(
        &self,
        probe: Arc<dyn Probe>,
        burst_size: usize,
    ) -> Result<BurstResult, LoadError> {
        if burst_size == 0 {
            return Err(LoadError::InvalidBurstSize);
        }

        info!(
            probe = %probe.kind(),
            target = probe.target(),
            burst_size,
            "sending burst"
        );

        let monitor = (!self.targets.process_names.is_empty()).then(|| {
            self.sampler.monitor_continuously(
                self.targets.process_names.clone(),
                self.monitor_window,
                self.monitor_interval,
            )
        });

        let succeeded = Arc::new(AtomicU64::new(0));

        let start = Instant::now();
        let mut handles = Vec::with_capacity(burst_size);
        for _ in 0..burst_size {
            let probe = probe.clone();
            let succeeded = succeeded.clone();
            handles.push(tokio::spawn(async move {
                if probe.send().await.success {
                    succeeded.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }

        // Snapshot while everything is in flight, on its own task so it
        // never stretches the measured duration.
        let local = self.targets.pid.map(|pid| {
            let sampler = self.sampler.clone();
            tokio::spawn(async move { sampler.sample_once(ProcessSelector::Pid(pid)).await })
        });

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "probe task failed");
            }
        }
        let duration = start.elapsed();

        let local = match local {
            Some(handle) => match handle.await {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!(error = %e, "local sample task failed");
                    None
                }
            },
            None => None,
        };

        let process_usage = match monitor {
            Some(monitor) => Some(monitor.join().await),
            None => None,
        };

        let succeeded = succeeded.load(Ordering::Relaxed);
        let failure_rate = failure_rate(succeeded, burst_size as u64);

        info!(
            burst_size,
            succeeded,
            duration_ms = duration.as_millis() as u64,
            failure_rate,
            "burst complete"
        );

        Ok(BurstResult {
            burst_size,
            succeeded,
            duration,
            failure_rate,
            local,
            process_usage,
        })
    }
}
