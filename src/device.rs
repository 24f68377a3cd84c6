//! Host fingerprint and idle-state measurements.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::System;
use tracing::warn;

/// Static description of the machine running the tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub cpu_base_clock_hz: u64,
    pub ram_total_bytes: u64,
    pub os_version: Option<String>,
    pub host_name: Option<String>,
}

/// Host-wide CPU and memory use over a short quiet window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IdleDeviceUsage {
    /// Share of total host CPU, in `[0, 1]`.
    pub cpu_fraction: f64,
    pub ram_used_bytes: u64,
}

pub fn device_info() -> DeviceInfo {
    let sys = System::new_all();
    let (cpu_model, mhz) = sys
        .cpus()
        .first()
        .map(|cpu| (cpu.brand().trim().to_string(), cpu.frequency()))
        .unwrap_or_default();

    DeviceInfo {
        cpu_model,
        cpu_cores: sys
            .physical_core_count()
            .unwrap_or_else(|| sys.cpus().len()),
        cpu_base_clock_hz: mhz * 1_000_000,
        ram_total_bytes: sys.total_memory(),
        os_version: System::long_os_version(),
        host_name: System::host_name(),
    }
}

/// Measure host CPU across `window` and read used memory at the end.
pub async fn idle_device_usage(window: Duration) -> IdleDeviceUsage {
    let window = window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    let measured = tokio::task::spawn_blocking(move || {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(window);
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        IdleDeviceUsage {
            cpu_fraction: (sys.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0),
            ram_used_bytes: sys.used_memory(),
        }
    })
    .await;

    match measured {
        Ok(usage) => usage,
        Err(e) => {
            warn!(error = %e, "idle device measurement failed");
            IdleDeviceUsage::default()
        }
    }
}

/// Multi-line summary for terminal output.
pub fn format_device_info(info: &DeviceInfo) -> String {
    let mut out = format!(
        "CPU model:      {}\nCPU cores:      {}\nCPU base clock: {:.2} GHz\nRAM total:      {:.1} GB",
        if info.cpu_model.is_empty() { "unknown" } else { info.cpu_model.as_str() },
        info.cpu_cores,
        info.cpu_base_clock_hz as f64 / 1e9,
        info.ram_total_bytes as f64 / 1e9,
    );
    if let Some(os) = &info.os_version {
        out.push_str(&format!("\nOS:             {os}"));
    }
    if let Some(host) = &info.host_name {
        out.push_str(&format!("\nHost:           {host}"));
    }
    out
}
