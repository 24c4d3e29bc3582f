//! Resource monitoring with hysteresis.
//!
//! The `ResourceMonitor` samples CPU load and memory through a
//! `ResourceProbe` and decides whether the host is overloaded. Once
//! overloaded it only recovers after both metrics fall below a dead-band
//! under their thresholds, so a metric sitting on the boundary does not
//! flap the scheduler's concurrency up and down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;

/// A point-in-time sample of host load. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    /// Normalized CPU load, 0.0 to 1.0 (may exceed 1.0 under heavy load).
    pub cpu_usage: f64,
    /// Used system memory in bytes.
    pub memory_usage: u64,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn new(cpu_usage: f64, memory_usage: u64) -> Self {
        Self {
            cpu_usage,
            memory_usage,
            timestamp: Utc::now(),
        }
    }
}

/// Limits the monitor evaluates snapshots against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_threshold: f64,
    /// Bytes of used memory considered overloaded.
    pub memory_threshold: u64,
    /// Width of the recovery band, as a fraction. Applied absolutely to
    /// CPU and relative to the threshold for memory.
    pub hysteresis: f64,
}

impl ResourceThresholds {
    fn cpu_recovery(&self) -> f64 {
        self.cpu_threshold - self.hysteresis
    }

    fn memory_recovery(&self) -> f64 {
        let threshold = self.memory_threshold as f64;
        threshold - threshold * self.hysteresis
    }
}

/// Outcome of evaluating one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDecision {
    pub overloaded: bool,
    pub should_downscale: bool,
    pub should_upscale: bool,
    /// Below the raw thresholds but still inside the recovery band, so the
    /// previous overload persists.
    pub hysteresis_active: bool,
    pub reason: String,
}

impl ResourceDecision {
    fn overloaded(reason: String, hysteresis_active: bool) -> Self {
        Self {
            overloaded: true,
            should_downscale: true,
            should_upscale: false,
            hysteresis_active,
            reason,
        }
    }

    fn normal(reason: String) -> Self {
        Self {
            overloaded: false,
            should_downscale: false,
            should_upscale: true,
            hysteresis_active: false,
            reason,
        }
    }
}

/// Source of resource samples.
pub trait ResourceProbe: Send {
    fn capture(&mut self) -> ResourceSnapshot;

    /// Total system memory, used to derive the default memory threshold.
    fn total_memory(&mut self) -> u64;
}

/// Probe backed by the host operating system.
pub struct SystemProbe {
    sys: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        Self { sys }
    }

    fn cpu_load(&mut self) -> f64 {
        let cores = self.sys.cpus().len().max(1) as f64;
        let load = System::load_average().one;
        if load > 0.0 {
            return load / cores;
        }
        // No load average on this platform; use instantaneous usage.
        self.sys.refresh_cpu_usage();
        f64::from(self.sys.global_cpu_usage()) / 100.0
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn capture(&mut self) -> ResourceSnapshot {
        self.sys.refresh_memory();
        let cpu = self.cpu_load();
        ResourceSnapshot::new(cpu, self.sys.used_memory())
    }

    fn total_memory(&mut self) -> u64 {
        self.sys.refresh_memory();
        self.sys.total_memory()
    }
}

/// Hysteresis-aware overload detector.
///
/// The only state kept between polls is whether the previous decision
/// was overloaded.
pub struct ResourceMonitor {
    probe: Box<dyn ResourceProbe>,
    thresholds: ResourceThresholds,
    overloaded: bool,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn ResourceProbe>, thresholds: ResourceThresholds) -> Self {
        Self {
            probe,
            thresholds,
            overloaded: false,
        }
    }

    pub fn capture_snapshot(&mut self) -> ResourceSnapshot {
        self.probe.capture()
    }

    /// Capture and evaluate in one step.
    pub fn poll(&mut self) -> (ResourceSnapshot, ResourceDecision) {
        let snapshot = self.capture_snapshot();
        let decision = self.evaluate(&snapshot);
        (snapshot, decision)
    }

    pub fn evaluate(&mut self, snapshot: &ResourceSnapshot) -> ResourceDecision {
        let t = &self.thresholds;
        let cpu = snapshot.cpu_usage;
        let memory = snapshot.memory_usage;

        let cpu_high = cpu >= t.cpu_threshold;
        let memory_high = memory >= t.memory_threshold;

        let decision = if cpu_high || memory_high {
            let reason = if cpu_high {
                format!("cpu_high: {:.2} >= {:.2}", cpu, t.cpu_threshold)
            } else {
                format!("memory_high: {} >= {} bytes", memory, t.memory_threshold)
            };
            ResourceDecision::overloaded(reason, false)
        } else if self.overloaded {
            let cpu_held = cpu > t.cpu_recovery();
            let memory_held = memory as f64 > t.memory_recovery();
            if cpu_held {
                ResourceDecision::overloaded(
                    format!(
                        "cpu_high: {:.2} still above recovery level {:.2}",
                        cpu,
                        t.cpu_recovery()
                    ),
                    true,
                )
            } else if memory_held {
                ResourceDecision::overloaded(
                    format!(
                        "memory_high: {} still above recovery level {:.0} bytes",
                        memory,
                        t.memory_recovery()
                    ),
                    true,
                )
            } else {
                ResourceDecision::normal(format!(
                    "cpu_normalized: {:.2} <= {:.2}",
                    cpu,
                    t.cpu_recovery()
                ))
            }
        } else {
            ResourceDecision::normal(format!("cpu_normalized: {:.2} < {:.2}", cpu, t.cpu_threshold))
        };

        if decision.overloaded != self.overloaded {
            tracing::info!(
                cpu,
                memory,
                overloaded = decision.overloaded,
                reason = %decision.reason,
                "resource state changed"
            );
        }
        self.overloaded = decision.overloaded;
        decision
    }
}
