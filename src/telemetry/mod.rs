//! Periodic system and accelerator telemetry.
//!
//! A background task samples every source once per tick, reconciles the
//! readings and publishes an immutable snapshot on a watch channel. Readers
//! always see the newest snapshot; nothing queues up behind a slow reader.

mod aggregate;
mod sources;

pub use aggregate::{aggregate, sort_readings};
pub use sources::{
    parse_counter_output, parse_nvidia_smi_csv, platform_adapters, platform_samplers, NvidiaSmi,
    PowerShellCounters, SysfsAdapters, SysfsCounters, SysinfoHost,
};
#[cfg(target_os = "windows")]
pub use sources::DxgiAdapters;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, LazyLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TelemetryConfig;

static LUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)luid_0x([0-9a-f]{1,8})_0x([0-9a-f]{1,8})").expect("valid luid regex")
});

/// Locally unique adapter identity. The two halves are stored ordered, so
/// a key parsed with its halves swapped compares equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AdapterKey {
    lo: u32,
    hi: u32,
}

impl AdapterKey {
    pub fn new(a: u32, b: u32) -> Self {
        Self {
            lo: a.min(b),
            hi: a.max(b),
        }
    }

    /// From a LUID as adapter enumeration reports it.
    pub fn from_luid(low_part: u32, high_part: i32) -> Self {
        Self::new(low_part, high_part as u32)
    }

    /// Pull the key out of a counter instance name such as
    /// `pid_1234_luid_0x00000000_0x0000D1B5_phys_0_eng_0_engtype_3D`.
    pub fn parse(instance: &str) -> Option<Self> {
        let caps = LUID_RE.captures(instance)?;
        let a = u32::from_str_radix(caps.get(1)?.as_str(), 16).ok()?;
        let b = u32::from_str_radix(caps.get(2)?.as_str(), 16).ok()?;
        Some(Self::new(a, b))
    }

    /// Counter-instance form of this key, used by sources that have no
    /// native instance names.
    pub fn instance_name(&self) -> String {
        format!("luid_0x{:08X}_0x{:08X}_phys_0", self.lo, self.hi)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    EngineUtilization,
    NpuUtilization,
    DedicatedUsage,
    DedicatedLimit,
    SharedUsage,
    SharedLimit,
}

/// One raw counter instance. Memory values are bytes, utilization is percent.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSample {
    pub instance: String,
    pub kind: CounterKind,
    pub value: f64,
}

/// PCI vendor id of NVIDIA, the only vendor nvidia-smi reports on.
pub const NVIDIA_VENDOR_ID: u32 = 0x10de;

/// An adapter as the enumeration API reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub index: u32,
    pub description: String,
    pub key: AdapterKey,
    pub dedicated_memory_bytes: u64,
    /// PCI vendor id, 0 when unknown.
    pub vendor_id: u32,
}

impl AdapterInfo {
    pub fn is_nvidia(&self) -> bool {
        self.vendor_id == NVIDIA_VENDOR_ID || self.description.to_ascii_lowercase().contains("nvidia")
    }
}

/// A reading from a vendor tool (nvidia-smi).
#[derive(Debug, Clone, PartialEq)]
pub struct VendorGpuReading {
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AcceleratorKind {
    Gpu,
    Npu,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorReading {
    pub name: String,
    pub kind: AcceleratorKind,
    pub utilization_percent: f32,
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
    pub adapter_index: Option<u32>,
    #[serde(skip)]
    pub adapter_key: Option<AdapterKey>,
}

/// CPU, memory and disk figures for the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostReading {
    pub cpu_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub disk_percent: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub taken_at: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub disk_percent: Option<f32>,
    pub accelerators: Vec<AcceleratorReading>,
    // Single-GPU fields for older consumers, copied from the first GPU.
    pub gpu_name: Option<String>,
    pub gpu_percent: f32,
    pub gpu_mem_used_mb: u64,
    pub gpu_mem_total_mb: u64,
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            taken_at: Utc::now(),
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_used_mb: 0,
            memory_total_mb: 0,
            disk_percent: None,
            accelerators: Vec::new(),
            gpu_name: None,
            gpu_percent: 0.0,
            gpu_mem_used_mb: 0,
            gpu_mem_total_mb: 0,
        }
    }
}

impl SystemSnapshot {
    pub fn build(host: HostReading, accelerators: Vec<AcceleratorReading>) -> Self {
        let memory_percent = if host.memory_total_mb > 0 {
            (host.memory_used_mb as f64 / host.memory_total_mb as f64 * 100.0) as f32
        } else {
            0.0
        };
        let first_gpu = accelerators.iter().find(|a| a.kind == AcceleratorKind::Gpu);
        Self {
            taken_at: Utc::now(),
            cpu_percent: host.cpu_percent.clamp(0.0, 100.0),
            memory_percent: memory_percent.clamp(0.0, 100.0),
            memory_used_mb: host.memory_used_mb,
            memory_total_mb: host.memory_total_mb,
            disk_percent: host.disk_percent,
            gpu_name: first_gpu.map(|g| g.name.clone()),
            gpu_percent: first_gpu.map(|g| g.utilization_percent).unwrap_or(0.0),
            gpu_mem_used_mb: first_gpu.map(|g| g.mem_used_mb).unwrap_or(0),
            gpu_mem_total_mb: first_gpu.map(|g| g.mem_total_mb).unwrap_or(0),
            accelerators,
        }
    }
}

/// Performance-counter families (engine utilization, adapter memory).
pub trait CounterSource: Send {
    fn sample(&mut self) -> Vec<CounterSample>;
}

/// Stable adapter list, queried once when the aggregator starts.
pub trait AdapterEnumerator: Send {
    fn enumerate(&self) -> Vec<AdapterInfo>;
}

pub trait VendorSampler: Send {
    fn read(&mut self) -> Vec<VendorGpuReading>;
}

pub trait HostSampler: Send {
    fn read(&mut self) -> HostReading;
}

/// The per-tick sources. They are blocking and run off the async workers.
pub struct Samplers {
    pub counters: Box<dyn CounterSource>,
    pub vendor: Box<dyn VendorSampler>,
    pub host: Box<dyn HostSampler>,
}

impl Samplers {
    fn collect(&mut self, adapters: &[AdapterInfo], cfg: &TelemetryConfig) -> SystemSnapshot {
        let host = self.host.read();
        let samples = self.counters.sample();
        let vendor = self.vendor.read();
        SystemSnapshot::build(host, aggregate(&samples, adapters, &vendor, cfg))
    }
}

/// Start the tick loop. The returned receiver always holds the newest
/// snapshot; the task ends when `cancel` fires or every receiver is gone.
pub fn spawn_aggregator(
    config: TelemetryConfig,
    samplers: Samplers,
    enumerator: Box<dyn AdapterEnumerator>,
    cancel: CancellationToken,
) -> (watch::Receiver<Arc<SystemSnapshot>>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(Arc::new(SystemSnapshot::default()));
    let handle = tokio::spawn(run_loop(config, samplers, enumerator, tx, cancel));
    (rx, handle)
}

async fn run_loop(
    config: TelemetryConfig,
    samplers: Samplers,
    enumerator: Box<dyn AdapterEnumerator>,
    tx: watch::Sender<Arc<SystemSnapshot>>,
    cancel: CancellationToken,
) {
    let adapters = match tokio::task::spawn_blocking(move || enumerator.enumerate()).await {
        Ok(list) => Arc::new(list),
        Err(e) => {
            log::warn!("[telemetry] adapter enumeration failed: {}", e);
            Arc::new(Vec::new())
        }
    };
    log::info!("[telemetry] {} adapter(s) enumerated", adapters.len());

    let mut interval = tokio::time::interval(config.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut samplers = Some(samplers);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(mut current) = samplers.take() else {
            break;
        };
        let adapters_for_tick = adapters.clone();
        let cfg = config.clone();
        let tick = tokio::task::spawn_blocking(move || {
            let snapshot = current.collect(&adapters_for_tick, &cfg);
            (current, snapshot)
        });
        let (returned, snapshot) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = tick => match r {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("[telemetry] sampling task failed, stopping: {}", e);
                    break;
                }
            },
        };
        samplers = Some(returned);
        if tx.send(Arc::new(snapshot)).is_err() {
            log::debug!("[telemetry] no subscribers left");
            break;
        }
    }
    log::info!("[telemetry] stopped");
}
