//! Closed-loop pacing: dispatch probes at a target rate for a fixed window.

use super::pid::{PidController, PidGains};
use super::{failure_rate, LoadError};
use crate::probes::Probe;
use crate::resources::{ProcessUsageSample, ResourceSampler, ResourceTargets};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RateResult {
    pub desired_rps: f64,
    pub test_duration: Duration,
    /// Wall time of the whole call, including the final join. May exceed
    /// `test_duration` because in-flight probes are never cancelled.
    pub elapsed: Duration,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failure_rate: f64,
    /// Mean CPU over the pacing window, last RAM reading.
    pub local: Option<ProcessUsageSample>,
}

impl RateResult {
    pub fn achieved_rps(&self) -> f64 {
        let secs = self.test_duration.as_secs_f64();
        if secs > 0.0 {
            self.dispatched as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Clone)]
pub struct RateController {
    sampler: ResourceSampler,
    targets: ResourceTargets,
    gains: PidGains,
    poll_interval: Duration,
}

impl RateController {
    pub fn new(sampler: ResourceSampler, targets: ResourceTargets) -> Self {
        Self {
            sampler,
            targets,
            gains: PidGains::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_gains(mut self, gains: PidGains) -> Self {
        self.gains = gains;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Dispatch `probe` at `desired_rps` until `test_duration` has elapsed,
    /// then wait for every dispatched probe before computing the failure
    /// rate.
    pub async fn run_rate(
        &self,
        probe: Arc<dyn Probe>,
        desired_rps: f64,
        test_duration: Duration,
    ) -> Result<RateResult, LoadError> {
        let nominal = 1.0 / desired_rps;
        if !desired_rps.is_finite() || desired_rps <= 0.0 || !nominal.is_finite() {
            return Err(LoadError::InvalidRate(desired_rps));
        }
        if test_duration.is_zero() {
            return Err(LoadError::InvalidDuration);
        }

        info!(
            probe = %probe.kind(),
            target = probe.target(),
            desired_rps,
            duration_ms = test_duration.as_millis() as u64,
            "starting paced run"
        );

        let poll = self
            .targets
            .pid
            .map(|pid| self.sampler.poll_local(pid, self.poll_interval));

        let mut pid = PidController::new(self.gains);
        let succeeded = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        let mut dispatched = 0u64;

        let start = Instant::now();
        tokio::time::sleep(secs_to_duration(nominal)).await;
        let mut last = Instant::now();

        loop {
            let elapsed = start.elapsed();
            if elapsed >= test_duration {
                break;
            }

            let probe = probe.clone();
            let succeeded = succeeded.clone();
            handles.push(tokio::spawn(async move {
                if probe.send().await.success {
                    succeeded.fetch_add(1, Ordering::Relaxed);
                }
            }));
            dispatched += 1;

            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64();
            last = now;

            let achieved = dispatched as f64 / elapsed.as_secs_f64();
            let error = nominal - 1.0 / achieved;
            let output = pid.update(error, dt);
            let pause = (nominal + output).max(0.0);

            debug!(dispatched, achieved, output, pause, "pacing");
            tokio::time::sleep(secs_to_duration(pause)).await;
        }

        let local = match poll {
            Some(poll) => Some(poll.stop().await),
            None => None,
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "probe task failed");
            }
        }
        let elapsed = start.elapsed();

        let succeeded = succeeded.load(Ordering::Relaxed);
        let failure_rate = failure_rate(succeeded, dispatched);

        info!(
            desired_rps,
            dispatched,
            succeeded,
            failure_rate,
            elapsed_ms = elapsed.as_millis() as u64,
            "paced run complete"
        );

        Ok(RateResult {
            desired_rps,
            test_duration,
            elapsed,
            dispatched,
            succeeded,
            failure_rate,
            local,
        })
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::{Outcome, ProbeKind};
    use crate::resources::{ProcessSelector, ProcessStatProvider, SamplingError};

    struct InstantProbe {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Probe for InstantProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::HttpGet
        }

        fn target(&self) -> &str {
            "stub"
        }

        async fn send(&self) -> Outcome {
            if self.fail {
                Outcome::failure(Duration::ZERO)
            } else {
                Outcome::success(1, Duration::ZERO)
            }
        }
    }

    struct SlowProbe;

    #[async_trait::async_trait]
    impl Probe for SlowProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::HttpGet
        }

        fn target(&self) -> &str {
            "slow"
        }

        async fn send(&self) -> Outcome {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Outcome::success(1, Duration::from_millis(300))
        }
    }

    struct FixedProvider;

    impl ProcessStatProvider for FixedProvider {
        fn sample(&self, selector: &ProcessSelector) -> Result<ProcessUsageSample, SamplingError> {
            Ok(ProcessUsageSample {
                process_name: selector.label(),
                cpu_fraction: 0.125,
                ram_bytes: 2_000_000,
                process_count: 1,
            })
        }
    }

    fn controller(targets: ResourceTargets) -> RateController {
        RateController::new(ResourceSampler::new(Arc::new(FixedProvider)), targets)
    }

    async fn assert_converges(desired: f64) {
        let duration = Duration::from_secs(2);
        let result = controller(ResourceTargets::none())
            .run_rate(Arc::new(InstantProbe { fail: false }), desired, duration)
            .await
            .unwrap();

        let expected = desired * duration.as_secs_f64();
        let deviation = (result.dispatched as f64 - expected).abs() / expected;
        assert!(
            deviation <= 0.15,
            "{} rps: dispatched {} vs expected {}",
            desired,
            result.dispatched,
            expected
        );
        assert_eq!(result.failure_rate, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_converges_at_10_rps() {
        assert_converges(10.0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_converges_at_50_rps() {
        assert_converges(50.0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_converges_at_100_rps() {
        assert_converges(100.0).await;
    }

    #[tokio::test]
    async fn test_rejects_bad_rates() {
        let c = controller(ResourceTargets::none());
        for rate in [0.0, -5.0, f64::NAN, f64::INFINITY, 1.0e-320] {
            let result = c
                .run_rate(
                    Arc::new(InstantProbe { fail: false }),
                    rate,
                    Duration::from_secs(1),
                )
                .await;
            assert!(matches!(result, Err(LoadError::InvalidRate(_))), "rate {rate}");
        }
    }

    #[tokio::test]
    async fn test_rejects_zero_duration() {
        let result = controller(ResourceTargets::none())
            .run_rate(Arc::new(InstantProbe { fail: false }), 10.0, Duration::ZERO)
            .await;
        assert!(matches!(result, Err(LoadError::InvalidDuration)));
    }

    #[tokio::test]
    async fn test_all_failures() {
        let result = controller(ResourceTargets::none())
            .run_rate(
                Arc::new(InstantProbe { fail: true }),
                20.0,
                Duration::from_millis(500),
            )
            .await
            .unwrap();
        assert!(result.dispatched > 0);
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failure_rate, 1.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_in_flight_probes_are_joined() {
        let result = controller(ResourceTargets::none())
            .run_rate(Arc::new(SlowProbe), 20.0, Duration::from_millis(200))
            .await
            .unwrap();

        // Every dispatched probe completed and was counted.
        assert_eq!(result.succeeded, result.dispatched);
        // First dispatch happens after one 50 ms nominal interval.
        assert!(result.elapsed >= Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_local_poll_is_reported() {
        let targets = ResourceTargets {
            pid: Some(77),
            process_names: vec![],
        };
        let result = controller(targets)
            .with_poll_interval(Duration::from_millis(10))
            .run_rate(
                Arc::new(InstantProbe { fail: false }),
                20.0,
                Duration::from_millis(200),
            )
            .await
            .unwrap();

        let local = result.local.unwrap();
        assert_eq!(local.cpu_fraction, 0.125);
        assert_eq!(local.ram_bytes, 2_000_000);
    }

    #[test]
    fn test_secs_to_duration_never_panics() {
        assert_eq!(secs_to_duration(-1.0), Duration::ZERO);
        assert_eq!(secs_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(secs_to_duration(0.5), Duration::from_millis(500));
    }
}
