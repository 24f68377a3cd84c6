//! Result records and the aggregation step that produces them.
//!
//! The functions here are pure: they combine a runner's outcome with the
//! resource sample taken in the same window and convert units for output.
//! This is the only place that treats a RAM reading of zero as "no sample".

pub mod sink;

use crate::config::Config;
use crate::device::{DeviceInfo, IdleDeviceUsage};
use crate::latency::{LatencyKind, LatencyResult};
use crate::load::{BurstResult, RateResult};
use crate::resources::{AggregatedProcessUsage, ProcessUsageSample};
use crate::throughput::{Direction, ThroughputResult};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub use sink::{JsonLinesSink, MemorySink, ResultSink, TracingSink};

const BYTES_PER_MB: f64 = 1e6;

// ---------------------------------------------------------------------------
// TestFamily
// ---------------------------------------------------------------------------

/// One kind of test run by the suite. Each family gets its own result file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFamily {
    ConfigInfo,
    DeviceInfo,
    IdleDevice,
    IdleProcess,
    HttpThroughput,
    HttpsThroughput,
    Ping,
    Jitter,
    HttpBurst,
    HttpsBurst,
    HttpRate,
    HttpsRate,
    DnsUdpBurst,
    DnsTcpBurst,
    DnsUdpRate,
    DnsTcpRate,
}

impl TestFamily {
    pub fn file_stem(self) -> &'static str {
        match self {
            TestFamily::ConfigInfo => "configInfo",
            TestFamily::DeviceInfo => "deviceInfo",
            TestFamily::IdleDevice => "idleStateOfDevice",
            TestFamily::IdleProcess => "idleStateOfProcess",
            TestFamily::HttpThroughput => "httpThroughputTest",
            TestFamily::HttpsThroughput => "httpsThroughputTest",
            TestFamily::Ping => "pingTest",
            TestFamily::Jitter => "jitterTest",
            TestFamily::HttpBurst => "httpBurstTest",
            TestFamily::HttpsBurst => "httpsBurstTest",
            TestFamily::HttpRate => "httpRateTest",
            TestFamily::HttpsRate => "httpsRateTest",
            TestFamily::DnsUdpBurst => "dnsUdpBurstTest",
            TestFamily::DnsTcpBurst => "dnsTcpBurstTest",
            TestFamily::DnsUdpRate => "dnsUdpRateTest",
            TestFamily::DnsTcpRate => "dnsTcpRateTest",
        }
    }
}

impl std::fmt::Display for TestFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Local-process columns. Both are empty when no sample was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceColumns {
    pub avg_cpu_percent: Option<f64>,
    pub avg_ram_mb: Option<f64>,
}

/// Per named process, over the monitoring window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessColumns {
    pub avg_cpu_percent: f64,
    pub peak_ram_mb: f64,
    pub process_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurstRecord {
    pub requests_in_burst: usize,
    pub duration_ms: u64,
    pub failure_rate_percent: f64,
    #[serde(flatten)]
    pub resources: ResourceColumns,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub processes: BTreeMap<String, ProcessColumns>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateRecord {
    pub requests_per_second_target: f64,
    pub test_duration_ms: u64,
    pub failure_rate_percent: f64,
    #[serde(flatten)]
    pub resources: ResourceColumns,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputRecord {
    pub direction: Direction,
    pub bytes_transferred_mb: f64,
    pub duration_ms: u64,
    pub rate_mbs: f64,
    pub rate_mbps: f64,
    #[serde(flatten)]
    pub resources: ResourceColumns,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub processes: BTreeMap<String, ProcessColumns>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyRecord {
    pub kind: LatencyKind,
    pub average_ms: f64,
    pub measured: u32,
    pub lost: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdleRecord {
    /// `device`, or the PID that was sampled.
    pub subject: String,
    pub cpu_percent: f64,
    pub ram_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TestRecord {
    Burst(BurstRecord),
    Rate(RateRecord),
    Throughput(ThroughputRecord),
    Latency(LatencyRecord),
    Idle(IdleRecord),
    Device(DeviceInfo),
    /// Settings the run was made with.
    Config(Config),
}

/// A record as handed to a [`ResultSink`].
#[derive(Debug, Clone, Serialize)]
pub struct ResultEntry {
    pub timestamp: String,
    pub run_id: Uuid,
    pub family: TestFamily,
    #[serde(flatten)]
    pub record: TestRecord,
}

impl ResultEntry {
    pub fn new(run_id: Uuid, family: TestFamily, record: TestRecord) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id,
            family,
            record,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

pub fn resource_columns(sample: Option<&ProcessUsageSample>) -> ResourceColumns {
    match sample {
        Some(s) if s.ram_bytes != 0 => ResourceColumns {
            avg_cpu_percent: Some(s.cpu_fraction * 100.0),
            avg_ram_mb: Some(s.ram_bytes as f64 / BYTES_PER_MB),
        },
        _ => ResourceColumns::default(),
    }
}

pub fn process_columns(usage: Option<&AggregatedProcessUsage>) -> BTreeMap<String, ProcessColumns> {
    usage
        .map(|usage| {
            usage
                .iter()
                .map(|(name, u)| {
                    (
                        name.clone(),
                        ProcessColumns {
                            avg_cpu_percent: u.average_cpu_fraction * 100.0,
                            peak_ram_mb: u.peak_ram_bytes as f64 / BYTES_PER_MB,
                            process_count: u.process_count,
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn burst_record(result: &BurstResult) -> BurstRecord {
    BurstRecord {
        requests_in_burst: result.burst_size,
        duration_ms: result.duration.as_millis() as u64,
        failure_rate_percent: result.failure_rate * 100.0,
        resources: resource_columns(result.local.as_ref()),
        processes: process_columns(result.process_usage.as_ref()),
    }
}

pub fn rate_record(result: &RateResult) -> RateRecord {
    RateRecord {
        requests_per_second_target: result.desired_rps,
        test_duration_ms: result.test_duration.as_millis() as u64,
        failure_rate_percent: result.failure_rate * 100.0,
        resources: resource_columns(result.local.as_ref()),
    }
}

pub fn throughput_record(result: &ThroughputResult) -> ThroughputRecord {
    ThroughputRecord {
        direction: result.direction,
        bytes_transferred_mb: result.bytes_transferred as f64 / BYTES_PER_MB,
        duration_ms: result.duration.as_millis() as u64,
        rate_mbs: result.bytes_per_second() / BYTES_PER_MB,
        rate_mbps: result.bits_per_second() / BYTES_PER_MB,
        resources: resource_columns(result.local.as_ref()),
        processes: process_columns(result.process_usage.as_ref()),
    }
}

pub fn latency_record(result: &LatencyResult) -> LatencyRecord {
    LatencyRecord {
        kind: result.kind,
        average_ms: result.average_ms(),
        measured: result.measured,
        lost: result.lost,
    }
}

pub fn idle_process_record(sample: &ProcessUsageSample) -> IdleRecord {
    IdleRecord {
        subject: sample.process_name.clone(),
        cpu_percent: sample.cpu_fraction * 100.0,
        ram_mb: sample.ram_bytes as f64 / BYTES_PER_MB,
    }
}

pub fn idle_device_record(usage: &IdleDeviceUsage) -> IdleRecord {
    IdleRecord {
        subject: "device".to_string(),
        cpu_percent: usage.cpu_fraction * 100.0,
        ram_mb: usage.ram_used_bytes as f64 / BYTES_PER_MB,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
