//! Samples CPU, memory, load average, file-descriptor count, and cgroup
//! v2 pressure, then exposes admission and concurrency-scaling decisions
//! to the exec scheduler.
//!
//! Platform reads are behind `SystemReader` so tests never touch
//! `/proc` or spawn `lsof`; production code gets `RealSystemReader`.

use std::sync::Arc;

use openclaw_clock::SharedClock;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    None,
    Some,
    Full,
}

pub trait SystemReader: Send + Sync {
    fn logical_cpu_count(&self) -> usize;
    /// 1-minute load average.
    fn load_avg_1m(&self) -> f64;
    fn fd_count(&self) -> u64;
    /// `(used_bytes, limit_bytes)` from cgroup v2 `memory.current`/`memory.max`,
    /// or process-level figures when no cgroup is present.
    fn memory_usage(&self) -> (u64, u64);
    fn memory_pressure(&self) -> MemoryPressure;
    fn cpu_throttled(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_load_avg: f64,
    pub max_fd_count: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: 90.0,
            max_memory_percent: 90.0,
            max_load_avg: 4.0,
            max_fd_count: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub load_avg_1m: f64,
    pub fd_count: u64,
    pub memory_pressure: MemoryPressure,
    pub cpu_throttled: bool,
    pub sampled_at_ms: i64,
}

impl ResourceSample {
    fn memory_percent(&self) -> f64 {
        if self.memory_limit_bytes == 0 {
            0.0
        } else {
            self.memory_used_bytes as f64 / self.memory_limit_bytes as f64 * 100.0
        }
    }

    fn load_ratio(&self, cpu_count: usize) -> f64 {
        let denom = (cpu_count.max(1)) as f64;
        self.load_avg_1m / denom
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

pub struct ResourceMonitor {
    reader: Arc<dyn SystemReader>,
    config: ResourceConfig,
    clock: SharedClock,
    latest: Mutex<ResourceSample>,
}

impl ResourceMonitor {
    pub fn new(reader: Arc<dyn SystemReader>, config: ResourceConfig, clock: SharedClock) -> Self {
        let initial = sample_from(&*reader, clock.now_ms());
        Self {
            reader,
            config,
            clock,
            latest: Mutex::new(initial),
        }
    }

    pub fn sample(&self) -> ResourceSample {
        let sample = sample_from(&*self.reader, self.clock.now_ms());
        *self.latest.lock() = sample;
        sample
    }

    pub fn latest(&self) -> ResourceSample {
        *self.latest.lock()
    }

    pub fn can_start_process(&self) -> AdmissionDecision {
        let sample = self.sample();
        let cpu_count = self.reader.logical_cpu_count();

        if sample.memory_pressure == MemoryPressure::Full {
            return deny("memory pressure full");
        }
        if sample.cpu_percent > self.config.max_cpu_percent {
            return deny(format!(
                "cpu {:.1}% over limit {:.1}%",
                sample.cpu_percent, self.config.max_cpu_percent
            ));
        }
        if sample.memory_percent() > self.config.max_memory_percent {
            return deny(format!(
                "memory {:.1}% over limit {:.1}%",
                sample.memory_percent(),
                self.config.max_memory_percent
            ));
        }
        let load_ceiling = self.config.max_load_avg.max(cpu_count as f64 * 0.8);
        if sample.load_avg_1m > load_ceiling {
            return deny(format!(
                "load average {:.2} over limit {:.2}",
                sample.load_avg_1m, load_ceiling
            ));
        }
        if sample.fd_count > self.config.max_fd_count {
            return deny(format!(
                "fd count {} over limit {}",
                sample.fd_count, self.config.max_fd_count
            ));
        }
        AdmissionDecision {
            allowed: true,
            reason: None,
        }
    }

    pub fn recommended_concurrency(&self, base: usize) -> usize {
        let sample = self.latest();
        let cpu_count = self.reader.logical_cpu_count();
        let load_ratio = sample.load_ratio(cpu_count);

        let scaled = if sample.memory_pressure == MemoryPressure::Some {
            base as f64 * 0.5
        } else if load_ratio > 0.8 {
            base as f64 * 0.5
        } else if load_ratio > 0.6 {
            base as f64 * 0.75
        } else if load_ratio < 0.3 {
            (base as f64 * 1.5).min((base + 2) as f64)
        } else {
            base as f64
        };

        scaled.round().max(1.0) as usize
    }
}

fn sample_from(reader: &dyn SystemReader, now_ms: i64) -> ResourceSample {
    let (used, limit) = reader.memory_usage();
    let cpu_count = reader.logical_cpu_count();
    let load = reader.load_avg_1m();
    ResourceSample {
        cpu_percent: (load / cpu_count.max(1) as f64 * 100.0).min(100.0),
        memory_used_bytes: used,
        memory_limit_bytes: limit,
        load_avg_1m: load,
        fd_count: reader.fd_count(),
        memory_pressure: reader.memory_pressure(),
        cpu_throttled: reader.cpu_throttled(),
        sampled_at_ms: now_ms,
    }
}

fn deny(reason: impl Into<String>) -> AdmissionDecision {
    let reason = reason.into();
    tracing::warn!(reason = %reason, "process admission denied by resource monitor");
    AdmissionDecision {
        allowed: false,
        reason: Some(reason),
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    use super::{MemoryPressure, SystemReader};
    use std::fs;

    pub struct LinuxSystemReader;

    impl SystemReader for LinuxSystemReader {
        fn logical_cpu_count(&self) -> usize {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }

        fn load_avg_1m(&self) -> f64 {
            fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|s| s.split_whitespace().next().map(str::to_string))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0)
        }

        fn fd_count(&self) -> u64 {
            fs::read_dir("/proc/self/fd")
                .map(|entries| entries.count() as u64)
                .unwrap_or(0)
        }

        fn memory_usage(&self) -> (u64, u64) {
            let used = fs::read_to_string("/sys/fs/cgroup/memory.current")
                .ok()
                .and_then(|s| s.trim().parse().ok());
            let limit = fs::read_to_string("/sys/fs/cgroup/memory.max")
                .ok()
                .and_then(|s| {
                    let t = s.trim();
                    if t == "max" {
                        None
                    } else {
                        t.parse().ok()
                    }
                });
            match (used, limit) {
                (Some(u), Some(l)) => (u, l),
                _ => (0, 0),
            }
        }

        fn memory_pressure(&self) -> MemoryPressure {
            let content = match fs::read_to_string("/sys/fs/cgroup/memory.pressure") {
                Ok(c) => c,
                Err(_) => return MemoryPressure::None,
            };
            parse_pressure(&content)
        }

        fn cpu_throttled(&self) -> bool {
            fs::read_to_string("/sys/fs/cgroup/cpu.stat")
                .ok()
                .map(|s| {
                    s.lines()
                        .find(|l| l.starts_with("nr_throttled"))
                        .and_then(|l| l.split_whitespace().nth(1))
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(|v| v > 0)
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        }
    }

    fn parse_pressure(content: &str) -> MemoryPressure {
        // "full avg10=12.50 avg60=.. avg300=.. total=.." on its own line
        // above a "some ..." line; treat a nonzero avg10 on "full" as Full,
        // a nonzero avg10 on "some" as Some.
        let full_busy = content
            .lines()
            .find(|l| l.starts_with("full"))
            .and_then(|l| avg10(l))
            .map(|v| v > 0.0)
            .unwrap_or(false);
        if full_busy {
            return MemoryPressure::Full;
        }
        let some_busy = content
            .lines()
            .find(|l| l.starts_with("some"))
            .and_then(|l| avg10(l))
            .map(|v| v > 0.0)
            .unwrap_or(false);
        if some_busy {
            MemoryPressure::Some
        } else {
            MemoryPressure::None
        }
    }

    fn avg10(line: &str) -> Option<f64> {
        line.split_whitespace()
            .find_map(|tok| tok.strip_prefix("avg10="))
            .and_then(|v| v.parse().ok())
    }
}

#[cfg(target_os = "macos")]
pub mod macos {
    use super::{MemoryPressure, SystemReader};
    use std::process::Command;

    pub struct MacosSystemReader;

    impl SystemReader for MacosSystemReader {
        fn logical_cpu_count(&self) -> usize {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }

        fn load_avg_1m(&self) -> f64 {
            sysctl_f64("vm.loadavg").unwrap_or(0.0)
        }

        fn fd_count(&self) -> u64 {
            Command::new("lsof")
                .args(["-p", &std::process::id().to_string()])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).lines().count() as u64)
                .unwrap_or(0)
        }

        fn memory_usage(&self) -> (u64, u64) {
            (0, 0)
        }

        fn memory_pressure(&self) -> MemoryPressure {
            MemoryPressure::None
        }

        fn cpu_throttled(&self) -> bool {
            false
        }
    }

    fn sysctl_f64(name: &str) -> Option<f64> {
        let out = Command::new("sysctl").arg("-n").arg(name).output().ok()?;
        String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .find_map(|t| t.trim_matches(|c: char| !c.is_ascii_digit() && c != '.').parse().ok())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub mod fallback {
    use super::{MemoryPressure, SystemReader};

    /// Permissive reader for platforms without `/proc` or `lsof`: always
    /// reports a healthy system so admission never spuriously denies.
    pub struct FallbackSystemReader;

    impl SystemReader for FallbackSystemReader {
        fn logical_cpu_count(&self) -> usize {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
        fn load_avg_1m(&self) -> f64 {
            0.0
        }
        fn fd_count(&self) -> u64 {
            0
        }
        fn memory_usage(&self) -> (u64, u64) {
            (0, 0)
        }
        fn memory_pressure(&self) -> MemoryPressure {
            MemoryPressure::None
        }
        fn cpu_throttled(&self) -> bool {
            false
        }
    }
}
