//! Runs the configured test families in order and feeds their records to
//! the sinks.

use crate::config::Config;
use crate::device;
use crate::latency;
use crate::load::{BurstRunner, RateController};
use crate::probes::{
    http_client, DnsQueryProbe, DnsTransport, HttpGetProbe, HttpStreamPostProbe, Probe,
    UdpEchoProbe,
};
use crate::report::{self, ResultEntry, ResultSink, TestFamily, TestRecord};
use crate::resources::{ProcessSelector, ResourceSampler};
use crate::throughput::{HttpTransport, ThroughputRunner};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Execution order of a full run.
pub const FAMILY_ORDER: [TestFamily; 14] = [
    TestFamily::IdleDevice,
    TestFamily::IdleProcess,
    TestFamily::HttpThroughput,
    TestFamily::HttpsThroughput,
    TestFamily::Ping,
    TestFamily::Jitter,
    TestFamily::HttpBurst,
    TestFamily::HttpsBurst,
    TestFamily::HttpRate,
    TestFamily::HttpsRate,
    TestFamily::DnsUdpBurst,
    TestFamily::DnsTcpBurst,
    TestFamily::DnsUdpRate,
    TestFamily::DnsTcpRate,
];

/// Chunk size of streamed POST probe bodies.
const POST_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum FamilyStatus {
    Completed { records: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FamilyOutcome {
    pub family: TestFamily,
    pub status: FamilyStatus,
}

#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub run_id: Uuid,
    pub outcomes: Vec<FamilyOutcome>,
}

impl SuiteReport {
    pub fn failures(&self) -> impl Iterator<Item = &FamilyOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, FamilyStatus::Failed { .. }))
    }

    pub fn all_passed(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// What a single probe should hit.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeTarget {
    HttpGet { https: bool, path: String },
    HttpPost { https: bool, payload_bytes: u64 },
    Dns(DnsTransport),
    UdpEcho,
}

/// Build a shareable probe for `target` from the client settings.
pub async fn build_probe(config: &Config, target: &ProbeTarget) -> Result<Arc<dyn Probe>> {
    let client_cfg = &config.client;
    let probes = &config.probes;

    let probe: Arc<dyn Probe> = match target {
        ProbeTarget::HttpGet { https, path } => {
            let client = http_client(client_cfg.ca_cert_path.as_deref(), client_cfg.request_timeout())?;
            let url = format!("{}{}", client_cfg.base_url(*https), path);
            Arc::new(HttpGetProbe::new(client, &url)?)
        }
        ProbeTarget::HttpPost {
            https,
            payload_bytes,
        } => {
            let client = http_client(client_cfg.ca_cert_path.as_deref(), client_cfg.request_timeout())?;
            let url = format!("{}/upload", client_cfg.base_url(*https));
            Arc::new(HttpStreamPostProbe::new(
                client,
                &url,
                *payload_bytes,
                POST_CHUNK_BYTES,
            )?)
        }
        ProbeTarget::Dns(transport) => {
            let port = match transport {
                DnsTransport::Udp => client_cfg.server_dns_udp_port,
                DnsTransport::Tcp => client_cfg.server_dns_tcp_port,
            };
            Arc::new(
                DnsQueryProbe::new(
                    &client_cfg.server_host,
                    port,
                    *transport,
                    &probes.dns_query_name,
                    Duration::from_millis(probes.dns_timeout_ms),
                )
                .await?,
            )
        }
        ProbeTarget::UdpEcho => Arc::new(echo_probe(config).await?),
    };
    Ok(probe)
}

pub async fn echo_probe(config: &Config) -> Result<UdpEchoProbe> {
    Ok(UdpEchoProbe::new(
        &config.client.server_host,
        config.client.server_ping_port,
        config.probes.echo_payload_bytes,
        Duration::from_millis(config.probes.echo_timeout_ms),
    )
    .await?)
}

pub fn throughput_runner(config: &Config, sampler: ResourceSampler, https: bool) -> Result<ThroughputRunner> {
    let settings = config.throughput_settings();
    let client = http_client(config.client.ca_cert_path.as_deref(), settings.transfer_timeout)?;
    let transport = HttpTransport::new(client, &config.client.base_url(https))?;
    Ok(ThroughputRunner::new(
        Arc::new(transport),
        sampler,
        config.resource_targets(),
        settings,
    )?)
}

pub fn burst_runner(config: &Config, sampler: ResourceSampler) -> BurstRunner {
    BurstRunner::new(sampler, config.resource_targets())
        .with_monitor_window(config.sampling.burst_window(), config.sampling.monitor_interval())
}

pub fn rate_controller(config: &Config, sampler: ResourceSampler) -> RateController {
    RateController::new(sampler, config.resource_targets())
        .with_gains(config.rate_control)
        .with_poll_interval(config.sampling.local_poll_interval())
}

pub struct Suite {
    config: Config,
    sampler: ResourceSampler,
    sinks: Vec<Arc<dyn ResultSink>>,
    run_id: Uuid,
}

impl Suite {
    pub fn new(config: Config, sampler: ResourceSampler, sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self {
            config,
            sampler,
            sinks,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn is_enabled(&self, family: TestFamily) -> bool {
        let t = &self.config.tests;
        match family {
            TestFamily::ConfigInfo | TestFamily::DeviceInfo => true,
            TestFamily::IdleDevice => t.idle_device.enable,
            TestFamily::IdleProcess => t.idle_process.enable,
            TestFamily::HttpThroughput => t.http_throughput.enable,
            TestFamily::HttpsThroughput => t.https_throughput.enable,
            TestFamily::Ping => t.ping.enable,
            TestFamily::Jitter => t.jitter.enable,
            TestFamily::HttpBurst => t.http_burst.enable,
            TestFamily::HttpsBurst => t.https_burst.enable,
            TestFamily::HttpRate => t.http_rate.enable,
            TestFamily::HttpsRate => t.https_rate.enable,
            TestFamily::DnsUdpBurst => t.dns_udp_burst.enable,
            TestFamily::DnsTcpBurst => t.dns_tcp_burst.enable,
            TestFamily::DnsUdpRate => t.dns_udp_rate.enable,
            TestFamily::DnsTcpRate => t.dns_tcp_rate.enable,
        }
    }

    /// Record the configuration and device info, then every enabled family
    /// in [`FAMILY_ORDER`]. A failing family is reported and the run moves on.
    pub async fn run(&self) -> SuiteReport {
        info!(run_id = %self.run_id, "starting test run");

        let mut outcomes = Vec::new();
        let preamble = [TestFamily::ConfigInfo, TestFamily::DeviceInfo];
        for family in preamble.into_iter().chain(FAMILY_ORDER) {
            if !self.is_enabled(family) {
                continue;
            }

            info!(%family, "running");
            let status = match self.run_family(family).await {
                Ok(records) => FamilyStatus::Completed { records },
                Err(e) => {
                    error!(%family, error = format!("{e:#}"), "test family failed");
                    FamilyStatus::Failed {
                        reason: format!("{e:#}"),
                    }
                }
            };
            outcomes.push(FamilyOutcome { family, status });
        }

        let report = SuiteReport {
            run_id: self.run_id,
            outcomes,
        };
        info!(
            run_id = %self.run_id,
            families = report.outcomes.len(),
            failed = report.failures().count(),
            "test run finished"
        );
        report
    }

    /// Run one family and return how many records it produced.
    pub async fn run_family(&self, family: TestFamily) -> Result<usize> {
        let cfg = &self.config;
        match family {
            TestFamily::ConfigInfo => {
                self.emit(family, TestRecord::Config(cfg.clone())).await;
                Ok(1)
            }
            TestFamily::DeviceInfo => {
                let info = tokio::task::spawn_blocking(device::device_info)
                    .await
                    .context("device inspection task failed")?;
                self.emit(family, TestRecord::Device(info)).await;
                Ok(1)
            }
            TestFamily::IdleDevice => {
                let usage =
                    device::idle_device_usage(Duration::from_millis(cfg.tests.idle_device.window_ms))
                        .await;
                self.emit(family, TestRecord::Idle(report::idle_device_record(&usage)))
                    .await;
                Ok(1)
            }
            TestFamily::IdleProcess => {
                let Some(pid) = cfg.client.pid else {
                    bail!("idle process test needs client.pid");
                };
                let sample = self.sampler.sample_once(ProcessSelector::Pid(pid)).await;
                if sample.is_empty() {
                    warn!(pid, "process not found, recording zero usage");
                }
                self.emit(family, TestRecord::Idle(report::idle_process_record(&sample)))
                    .await;
                Ok(1)
            }
            TestFamily::HttpThroughput => self.throughput(family, false).await,
            TestFamily::HttpsThroughput => self.throughput(family, true).await,
            TestFamily::Ping => {
                let probe = echo_probe(cfg).await?;
                let result = latency::ping(&probe, cfg.tests.ping.count).await?;
                self.emit(family, TestRecord::Latency(report::latency_record(&result)))
                    .await;
                Ok(1)
            }
            TestFamily::Jitter => {
                let probe = echo_probe(cfg).await?;
                let result = latency::jitter(&probe, cfg.tests.jitter.count).await?;
                self.emit(family, TestRecord::Latency(report::latency_record(&result)))
                    .await;
                Ok(1)
            }
            TestFamily::HttpBurst | TestFamily::HttpsBurst => {
                let https = family == TestFamily::HttpsBurst;
                let target = ProbeTarget::HttpGet {
                    https,
                    path: cfg.probes.http_burst_path.clone(),
                };
                let sizes: Vec<usize> = if https {
                    cfg.tests.https_burst.sizes().collect()
                } else {
                    cfg.tests.http_burst.sizes().collect()
                };
                self.bursts(family, &target, &sizes).await
            }
            TestFamily::DnsUdpBurst | TestFamily::DnsTcpBurst => {
                let (transport, test) = if family == TestFamily::DnsUdpBurst {
                    (DnsTransport::Udp, &cfg.tests.dns_udp_burst)
                } else {
                    (DnsTransport::Tcp, &cfg.tests.dns_tcp_burst)
                };
                let sizes: Vec<usize> = test.sizes().collect();
                self.bursts(family, &ProbeTarget::Dns(transport), &sizes).await
            }
            TestFamily::HttpRate | TestFamily::HttpsRate => {
                let https = family == TestFamily::HttpsRate;
                let test = if https {
                    &cfg.tests.https_rate
                } else {
                    &cfg.tests.http_rate
                };
                let target = ProbeTarget::HttpGet {
                    https,
                    path: cfg.probes.http_rate_path.clone(),
                };
                self.rates(family, &target, test.targets().collect(), test.duration(), test.rest())
                    .await
            }
            TestFamily::DnsUdpRate | TestFamily::DnsTcpRate => {
                let (transport, test) = if family == TestFamily::DnsUdpRate {
                    (DnsTransport::Udp, &cfg.tests.dns_udp_rate)
                } else {
                    (DnsTransport::Tcp, &cfg.tests.dns_tcp_rate)
                };
                self.rates(
                    family,
                    &ProbeTarget::Dns(transport),
                    test.targets().collect(),
                    test.duration(),
                    test.rest(),
                )
                .await
            }
        }
    }

    /// Half duplex and full duplex run independently; whichever succeeds
    /// is recorded, and any failure fails the family.
    async fn throughput(&self, family: TestFamily, https: bool) -> Result<usize> {
        let runner = throughput_runner(&self.config, self.sampler.clone(), https)?;

        let mut records = 0;
        let mut failures = Vec::new();
        for (mode, outcome) in [
            ("half-duplex", runner.half_duplex().await),
            ("full-duplex", runner.full_duplex().await),
        ] {
            match outcome {
                Ok((rx, tx)) => {
                    for result in [&rx, &tx] {
                        self.emit(family, TestRecord::Throughput(report::throughput_record(result)))
                            .await;
                    }
                    records += 2;
                }
                Err(e) => {
                    warn!(%family, mode, error = %e, "throughput mode failed");
                    failures.push(format!("{mode} transfer failed: {e}"));
                }
            }
        }

        if !failures.is_empty() {
            bail!("{}", failures.join("; "));
        }
        Ok(records)
    }

    async fn bursts(&self, family: TestFamily, target: &ProbeTarget, sizes: &[usize]) -> Result<usize> {
        let probe = build_probe(&self.config, target).await?;
        let runner = burst_runner(&self.config, self.sampler.clone());

        for &size in sizes {
            let result = runner.run_burst(probe.clone(), size).await?;
            self.emit(family, TestRecord::Burst(report::burst_record(&result)))
                .await;
        }
        Ok(sizes.len())
    }

    async fn rates(
        &self,
        family: TestFamily,
        target: &ProbeTarget,
        targets: Vec<f64>,
        duration: Duration,
        rest: Duration,
    ) -> Result<usize> {
        let probe = build_probe(&self.config, target).await?;
        let controller = rate_controller(&self.config, self.sampler.clone());

        for (i, &rps) in targets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(rest).await;
            }
            let result = controller.run_rate(probe.clone(), rps, duration).await?;
            self.emit(family, TestRecord::Rate(report::rate_record(&result)))
                .await;
        }
        Ok(targets.len())
    }

    /// Hand one record to every sink. A sink failure is logged, not fatal.
    async fn emit(&self, family: TestFamily, record: TestRecord) {
        let entry = ResultEntry::new(self.run_id, family, record);
        for sink in &self.sinks {
            if let Err(e) = sink.record(&entry).await {
                warn!(%family, error = format!("{e:#}"), "result sink rejected entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemorySink;
    use crate::resources::{ProcessStatProvider, ProcessUsageSample, SamplingError};

    struct FixedProvider;

    impl ProcessStatProvider for FixedProvider {
        fn sample(&self, selector: &ProcessSelector) -> Result<ProcessUsageSample, SamplingError> {
            Ok(ProcessUsageSample {
                process_name: selector.label(),
                cpu_fraction: 0.05,
                ram_bytes: 7_000_000,
                process_count: 1,
            })
        }
    }

    fn suite(config: Config, sink: Arc<MemorySink>) -> Suite {
        Suite::new(
            config,
            ResourceSampler::new(Arc::new(FixedProvider)),
            vec![sink as Arc<dyn ResultSink>],
        )
    }

    #[tokio::test]
    async fn test_default_config_records_only_device_info() {
        let sink = Arc::new(MemorySink::new());
        let report = suite(Config::default(), sink.clone()).run().await;

        let families: Vec<_> = report.outcomes.iter().map(|o| o.family).collect();
        assert_eq!(families, vec![TestFamily::ConfigInfo, TestFamily::DeviceInfo]);
        assert!(report.all_passed());

        let entries = sink.entries().await;
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1].record, TestRecord::Device(_)));
        assert!(entries.iter().all(|e| e.run_id == report.run_id));
    }

    #[tokio::test]
    async fn test_configuration_is_recorded_first() {
        let mut config = Config::default();
        config.client.server_host = "10.1.2.3".into();
        config.client.pid = Some(4242);
        config.tests.idle_device.enable = true;
        config.tests.idle_device.window_ms = 200;
        config.tests.http_rate.duration_secs = 3;

        let sink = Arc::new(MemorySink::new());
        let report = suite(config.clone(), sink.clone()).run().await;
        assert_eq!(report.outcomes[0].family, TestFamily::ConfigInfo);
        assert_eq!(
            report.outcomes[0].status,
            FamilyStatus::Completed { records: 1 }
        );

        let entries = sink.entries().await;
        assert_eq!(entries[0].family, TestFamily::ConfigInfo);
        match &entries[0].record {
            TestRecord::Config(recorded) => assert_eq!(recorded, &config),
            other => panic!("expected config record, got {other:?}"),
        }
        assert_eq!(entries[1].family, TestFamily::DeviceInfo);

        let json = serde_json::to_value(&entries[0]).unwrap();
        assert_eq!(json["family"], "config_info");
        assert_eq!(json["record"], "config");
        assert_eq!(json["client"]["server_host"], "10.1.2.3");
        assert_eq!(json["client"]["pid"], 4242);
        assert_eq!(json["tests"]["http_rate"]["duration_secs"], 3);
    }

    #[tokio::test]
    async fn test_failed_family_does_not_stop_the_run() {
        let mut config = Config::default();
        // No pid configured, so the idle process family cannot run.
        config.tests.idle_process.enable = true;
        config.tests.idle_device.enable = true;
        config.tests.idle_device.window_ms = 200;

        let sink = Arc::new(MemorySink::new());
        let report = suite(config, sink.clone()).run().await;

        let families: Vec<_> = report.outcomes.iter().map(|o| o.family).collect();
        assert_eq!(
            families,
            vec![
                TestFamily::ConfigInfo,
                TestFamily::DeviceInfo,
                TestFamily::IdleDevice,
                TestFamily::IdleProcess
            ]
        );
        assert!(matches!(
            report.outcomes[3].status,
            FamilyStatus::Failed { ref reason } if reason.contains("client.pid")
        ));
        assert_eq!(report.failures().count(), 1);
        assert_eq!(sink.entries().await.len(), 3);
    }

    #[tokio::test]
    async fn test_idle_process_uses_configured_pid() {
        let mut config = Config::default();
        config.client.pid = Some(31337);
        config.tests.idle_process.enable = true;

        let sink = Arc::new(MemorySink::new());
        let s = suite(config, sink.clone());
        assert_eq!(s.run_family(TestFamily::IdleProcess).await.unwrap(), 1);

        let entries = sink.entries().await;
        match &entries[0].record {
            TestRecord::Idle(rec) => {
                assert_eq!(rec.subject, "31337");
                assert_eq!(rec.cpu_percent, 5.0);
                assert_eq!(rec.ram_mb, 7.0);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_ping_fails_family() {
        // Bound but silent, so every echo times out.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.client.server_ping_port = silent.local_addr().unwrap().port();
        config.probes.echo_timeout_ms = 20;
        config.tests.ping.enable = true;
        config.tests.ping.count = 2;

        let sink = Arc::new(MemorySink::new());
        let err = suite(config, sink).run_family(TestFamily::Ping).await.unwrap_err();
        assert!(err.to_string().contains("no usable round trips"));
    }

    #[test]
    fn test_family_order_matches_run_order() {
        assert_eq!(FAMILY_ORDER[0], TestFamily::IdleDevice);
        assert_eq!(FAMILY_ORDER[2], TestFamily::HttpThroughput);
        assert_eq!(FAMILY_ORDER[4], TestFamily::Ping);
        assert_eq!(FAMILY_ORDER[13], TestFamily::DnsTcpRate);
    }
}
