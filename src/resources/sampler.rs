//! Point, continuous and polled resource sampling on top of a
//! [`ProcessStatProvider`].

use super::{
    AggregatedProcessUsage, ProcessSelector, ProcessStatProvider, ProcessUsage,
    ProcessUsageSample, SamplingError, SysinfoProvider,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cheap to clone; every clone shares the same provider.
#[derive(Clone)]
pub struct ResourceSampler {
    provider: Arc<dyn ProcessStatProvider>,
}

impl ResourceSampler {
    pub fn new(provider: Arc<dyn ProcessStatProvider>) -> Self {
        Self { provider }
    }

    /// Sampler backed by the host's process table.
    pub fn sysinfo() -> Self {
        Self::new(Arc::new(SysinfoProvider::new()))
    }

    /// Take one reading. Never fails; problems yield a zero sample.
    pub async fn sample_once(&self, selector: ProcessSelector) -> ProcessUsageSample {
        let provider = self.provider.clone();
        let label = selector.label();
        match tokio::task::spawn_blocking(move || sample_or_zero(provider.as_ref(), &selector))
            .await
        {
            Ok(sample) => sample,
            Err(e) => {
                warn!(process = %label, error = %e, "sampling task failed");
                ProcessUsageSample::not_found(label)
            }
        }
    }

    /// One reading per named process, keyed by the requested name.
    pub async fn sample_processes(&self, names: &[String]) -> BTreeMap<String, ProcessUsageSample> {
        sample_round(self.provider.clone(), names.to_vec())
            .await
            .into_iter()
            .collect()
    }

    /// Sample `names` every `interval` until `duration` has elapsed.
    ///
    /// The accumulator is only written by the spawned task; readers go
    /// through [`MonitorHandle`].
    pub fn monitor_continuously(
        &self,
        names: Vec<String>,
        duration: Duration,
        interval: Duration,
    ) -> MonitorHandle {
        let usage = Arc::new(Mutex::new(UsageAccumulator::new(&names)));
        let task_usage = usage.clone();
        let provider = self.provider.clone();

        let task = tokio::spawn(async move {
            if names.is_empty() {
                return;
            }

            debug!(processes = ?names, duration_ms = duration.as_millis() as u64, "process monitor started");
            let start = Instant::now();
            while start.elapsed() < duration {
                let round = sample_round(provider.clone(), names.clone()).await;
                {
                    let mut acc = task_usage.lock().await;
                    for (name, sample) in &round {
                        acc.record(name, sample);
                    }
                }

                let remaining = duration.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(interval.min(remaining)).await;
            }
            debug!(processes = ?names, "process monitor finished");
        });

        MonitorHandle {
            usage,
            task: Some(task),
        }
    }

    /// Poll one PID until [`LocalPoll::stop`] is called. The result carries
    /// the mean CPU over all samples and the last RAM reading.
    pub fn poll_local(&self, pid: u32, interval: Duration) -> LocalPoll {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let provider = self.provider.clone();

        let task = tokio::spawn(async move {
            let mut mean_cpu = 0.0;
            let mut samples = 0u64;
            let mut last = ProcessUsageSample::not_found(pid.to_string());

            loop {
                let p = provider.clone();
                match tokio::task::spawn_blocking(move || {
                    sample_or_zero(p.as_ref(), &ProcessSelector::Pid(pid))
                })
                .await
                {
                    Ok(sample) => {
                        samples += 1;
                        mean_cpu += (sample.cpu_fraction - mean_cpu) / samples as f64;
                        last = sample;
                    }
                    Err(e) => warn!(pid, error = %e, "local sampling task failed"),
                }

                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            ProcessUsageSample {
                cpu_fraction: mean_cpu,
                ..last
            }
        });

        LocalPoll {
            pid,
            stop_tx,
            task,
        }
    }
}

/// Handle to a running continuous monitor. Dropping it stops the monitor.
pub struct MonitorHandle {
    usage: Arc<Mutex<UsageAccumulator>>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Current totals, read under the accumulator lock.
    pub async fn snapshot(&self) -> AggregatedProcessUsage {
        self.usage.lock().await.finalize()
    }

    /// Wait for the monitoring window to end and return the frozen totals.
    pub async fn join(mut self) -> AggregatedProcessUsage {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "process monitor task failed");
            }
        }
        self.usage.lock().await.finalize()
    }

    /// Stop sampling early and discard the totals.
    pub fn abort(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Handle to the local PID poller.
pub struct LocalPoll {
    pid: u32,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<ProcessUsageSample>,
}

impl LocalPoll {
    pub async fn stop(self) -> ProcessUsageSample {
        let _ = self.stop_tx.send(());
        match self.task.await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "local poller failed");
                ProcessUsageSample::not_found(self.pid.to_string())
            }
        }
    }
}

#[derive(Debug, Default)]
struct UsageAccumulator {
    entries: BTreeMap<String, ProcessUsage>,
}

impl UsageAccumulator {
    fn new(names: &[String]) -> Self {
        Self {
            entries: names
                .iter()
                .map(|n| (n.clone(), ProcessUsage::default()))
                .collect(),
        }
    }

    fn record(&mut self, name: &str, sample: &ProcessUsageSample) {
        let entry = self.entries.entry(name.to_string()).or_default();
        entry.samples += 1;
        // Running mean: a constant input stays exactly constant.
        entry.average_cpu_fraction +=
            (sample.cpu_fraction - entry.average_cpu_fraction) / entry.samples as f64;
        entry.peak_ram_bytes = entry.peak_ram_bytes.max(sample.ram_bytes);
        // Largest count seen, so a process exiting mid-window still shows up.
        entry.process_count = entry.process_count.max(sample.process_count);
    }

    fn finalize(&self) -> AggregatedProcessUsage {
        self.entries.clone()
    }
}

fn sample_or_zero(
    provider: &dyn ProcessStatProvider,
    selector: &ProcessSelector,
) -> ProcessUsageSample {
    match provider.sample(selector) {
        Ok(sample) => sample,
        Err(SamplingError::NotFound(_)) => {
            debug!(process = %selector.label(), "process not found");
            ProcessUsageSample::not_found(selector.label())
        }
        Err(e) => {
            warn!(process = %selector.label(), error = %e, "resource sampling degraded to zero");
            ProcessUsageSample::not_found(selector.label())
        }
    }
}

async fn sample_round(
    provider: Arc<dyn ProcessStatProvider>,
    names: Vec<String>,
) -> Vec<(String, ProcessUsageSample)> {
    let fallback = names.clone();
    let result = tokio::task::spawn_blocking(move || {
        names
            .into_iter()
            .map(|name| {
                let sample = sample_or_zero(provider.as_ref(), &ProcessSelector::Name(name.clone()));
                (name, sample)
            })
            .collect::<Vec<_>>()
    })
    .await;

    match result {
        Ok(round) => round,
        Err(e) => {
            warn!(error = %e, "sampling round failed");
            fallback
                .into_iter()
                .map(|name| {
                    let zero = ProcessUsageSample::not_found(name.clone());
                    (name, zero)
                })
                .collect()
        }
    }
}
