//! [`ProcessStatProvider`] backed by the `sysinfo` process table.

use super::{ProcessSelector, ProcessStatProvider, ProcessUsageSample, SamplingError};
use std::collections::HashSet;
use std::sync::Mutex;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System};

struct Inner {
    system: System,
    /// Selectors that already have a previous refresh, so CPU deltas are valid.
    primed: HashSet<ProcessSelector>,
}

pub struct SysinfoProvider {
    inner: Mutex<Inner>,
    cpu_count: usize,
}

impl SysinfoProvider {
    pub fn new() -> Self {
        let system = System::new_all();
        let cpu_count = system.cpus().len().max(1);
        Self {
            inner: Mutex::new(Inner {
                system,
                primed: HashSet::new(),
            }),
            cpu_count,
        }
    }

    /// sysinfo reports per-core percent; normalize to a host-wide fraction.
    fn cpu_fraction(&self, percent: f32) -> f64 {
        (percent as f64 / (100.0 * self.cpu_count as f64)).clamp(0.0, 1.0)
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn refresh(system: &mut System, selector: &ProcessSelector) {
    let kind = ProcessRefreshKind::new().with_cpu().with_memory();
    match selector {
        ProcessSelector::Pid(pid) => {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[Pid::from_u32(*pid)]),
                true,
                kind,
            );
        }
        ProcessSelector::Name(_) => {
            system.refresh_processes_specifics(ProcessesToUpdate::All, true, kind);
        }
    }
}

fn name_matches(process: &Process, needle: &str) -> bool {
    process.name().to_string_lossy().contains(needle)
}

impl ProcessStatProvider for SysinfoProvider {
    fn sample(&self, selector: &ProcessSelector) -> Result<ProcessUsageSample, SamplingError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| SamplingError::Unavailable("process table lock poisoned".into()))?;
        let inner = &mut *guard;

        refresh(&mut inner.system, selector);
        if inner.primed.insert(selector.clone()) {
            // CPU usage is a delta between two refreshes.
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            refresh(&mut inner.system, selector);
        }

        match selector {
            ProcessSelector::Pid(pid) => {
                let process = inner
                    .system
                    .process(Pid::from_u32(*pid))
                    .ok_or_else(|| SamplingError::NotFound(pid.to_string()))?;
                Ok(ProcessUsageSample {
                    process_name: process.name().to_string_lossy().into_owned(),
                    cpu_fraction: self.cpu_fraction(process.cpu_usage()),
                    ram_bytes: process.memory(),
                    process_count: 1,
                })
            }
            ProcessSelector::Name(name) => {
                let mut sample = ProcessUsageSample::not_found(name.clone());
                let mut cpu_percent = 0.0f32;
                for process in inner
                    .system
                    .processes()
                    .values()
                    .filter(|p| name_matches(p, name))
                {
                    cpu_percent += process.cpu_usage();
                    sample.ram_bytes += process.memory();
                    sample.process_count += 1;
                }
                sample.cpu_fraction = self.cpu_fraction(cpu_percent);
                Ok(sample)
            }
        }
    }
}
