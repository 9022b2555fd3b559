//! Turning one tick's raw readings into per-accelerator figures.
//!
//! Everything here is pure: the same inputs always give the same readings.

use std::collections::{BTreeMap, HashSet};

use super::{
    AcceleratorKind, AcceleratorReading, AdapterInfo, AdapterKey, CounterKind, CounterSample,
    VendorGpuReading,
};
use crate::config::TelemetryConfig;

const MB: f64 = 1024.0 * 1024.0;

/// Counter totals for one adapter, all from instances carrying its key.
#[derive(Debug, Default, Clone)]
struct AdapterCounters {
    engine_util: f64,
    npu_util: f64,
    has_gpu_engine: bool,
    has_npu_engine: bool,
    dedicated_usage: f64,
    dedicated_limit: f64,
    shared_usage: f64,
    shared_limit: f64,
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn bytes_to_mb(bytes: f64) -> u64 {
    (sanitize(bytes) / MB).round() as u64
}

fn group_by_adapter(samples: &[CounterSample]) -> BTreeMap<AdapterKey, AdapterCounters> {
    let mut groups: BTreeMap<AdapterKey, AdapterCounters> = BTreeMap::new();
    for sample in samples {
        let Some(key) = AdapterKey::parse(&sample.instance) else {
            continue;
        };
        let value = sanitize(sample.value);
        let g = groups.entry(key).or_default();
        match sample.kind {
            CounterKind::EngineUtilization => {
                g.engine_util += value;
                g.has_gpu_engine = true;
            }
            CounterKind::NpuUtilization => {
                g.npu_util += value;
                g.has_npu_engine = true;
            }
            CounterKind::DedicatedUsage => g.dedicated_usage += value,
            CounterKind::DedicatedLimit => g.dedicated_limit += value,
            CounterKind::SharedUsage => g.shared_usage += value,
            CounterKind::SharedLimit => g.shared_limit += value,
        }
    }
    groups
}

/// Map each counter key to an enumerated adapter: by key first, then by the
/// closest dedicated size among adapters nobody claimed yet.
fn resolve_adapters<'a>(
    groups: &BTreeMap<AdapterKey, AdapterCounters>,
    adapters: &'a [AdapterInfo],
) -> BTreeMap<AdapterKey, &'a AdapterInfo> {
    let mut resolved = BTreeMap::new();
    let mut claimed: HashSet<usize> = HashSet::new();

    for key in groups.keys() {
        if let Some((i, info)) = adapters.iter().enumerate().find(|(_, a)| a.key == *key) {
            resolved.insert(*key, info);
            claimed.insert(i);
        }
    }

    for (key, counters) in groups {
        if resolved.contains_key(key) || counters.dedicated_limit <= 0.0 {
            continue;
        }
        let best = adapters
            .iter()
            .enumerate()
            .filter(|(i, a)| !claimed.contains(i) && a.dedicated_memory_bytes > 0)
            .min_by(|(_, a), (_, b)| {
                let da = (a.dedicated_memory_bytes as f64 - counters.dedicated_limit).abs();
                let db = (b.dedicated_memory_bytes as f64 - counters.dedicated_limit).abs();
                da.total_cmp(&db)
            });
        if let Some((i, info)) = best {
            resolved.insert(*key, info);
            claimed.insert(i);
        }
    }
    resolved
}

/// Used and total memory in MB, from the first source that has a figure.
fn memory_for(counters: &AdapterCounters, info: Option<&AdapterInfo>, cfg: &TelemetryConfig) -> (u64, u64) {
    let shared_ceiling = cfg.shared_ceiling_mb as f64 * MB;
    if counters.dedicated_limit > 0.0 {
        (bytes_to_mb(counters.dedicated_usage), bytes_to_mb(counters.dedicated_limit))
    } else if counters.shared_limit > 0.0 && counters.shared_limit <= shared_ceiling {
        (bytes_to_mb(counters.shared_usage), bytes_to_mb(counters.shared_limit))
    } else {
        let total = info.map(|i| bytes_to_mb(i.dedicated_memory_bytes as f64)).unwrap_or(0);
        (bytes_to_mb(counters.dedicated_usage), total)
    }
}

fn estimate_used(util: f32, total_mb: u64, cfg: &TelemetryConfig) -> u64 {
    let estimate = (total_mb as f64 * f64::from(util) / 100.0).round() as u64;
    estimate.max(cfg.min_used_floor_mb).min(total_mb)
}

fn take_vendor_match(
    total_mb: u64,
    vendor: &[VendorGpuReading],
    used: &mut HashSet<usize>,
    cfg: &TelemetryConfig,
) -> Option<VendorGpuReading> {
    if total_mb == 0 {
        return None;
    }
    let (i, reading) = vendor
        .iter()
        .enumerate()
        .filter(|(i, v)| !used.contains(i) && v.memory_total_mb > 0)
        .map(|(i, v)| (i, v, v.memory_total_mb.abs_diff(total_mb)))
        .filter(|(_, _, diff)| *diff <= cfg.vendor_tolerance_mb)
        .min_by_key(|(_, _, diff)| *diff)
        .map(|(i, v, _)| (i, v))?;
    used.insert(i);
    Some(reading.clone())
}

/// Enumerated NVIDIA adapter for a vendor reading that has no counters:
/// nearest size within tolerance, else the first one whose size is unknown.
fn vendor_adapter<'a>(
    reading: &VendorGpuReading,
    adapters: &'a [AdapterInfo],
    claimed: &mut HashSet<AdapterKey>,
    cfg: &TelemetryConfig,
) -> Option<&'a AdapterInfo> {
    let mut by_size: Option<(&'a AdapterInfo, u64)> = None;
    let mut unsized_first: Option<&'a AdapterInfo> = None;
    for a in adapters {
        if !a.is_nvidia() || claimed.contains(&a.key) {
            continue;
        }
        if a.dedicated_memory_bytes == 0 {
            unsized_first = unsized_first.or(Some(a));
            continue;
        }
        let diff = bytes_to_mb(a.dedicated_memory_bytes as f64).abs_diff(reading.memory_total_mb);
        if diff <= cfg.vendor_tolerance_mb && by_size.map_or(true, |(_, best)| diff < best) {
            by_size = Some((a, diff));
        }
    }
    let found = by_size.map(|(a, _)| a).or(unsized_first)?;
    claimed.insert(found.key);
    Some(found)
}

/// Build the accelerator list for one tick.
///
/// Memory and utilization of a reading always come from the same adapter
/// key; a missing counter reads as zero for that adapter only. nvidia-smi
/// figures only ever replace the memory of an adapter known to be NVIDIA.
pub fn aggregate(
    samples: &[CounterSample],
    adapters: &[AdapterInfo],
    vendor: &[VendorGpuReading],
    cfg: &TelemetryConfig,
) -> Vec<AcceleratorReading> {
    let groups = group_by_adapter(samples);
    let resolved = resolve_adapters(&groups, adapters);
    let mut vendor_used: HashSet<usize> = HashSet::new();
    let mut unpaired_nvidia = 0usize;
    let mut out = Vec::with_capacity(groups.len() + vendor.len());

    for (key, counters) in &groups {
        let info = resolved.get(key).copied();
        let kind = if counters.has_npu_engine && !counters.has_gpu_engine {
            AcceleratorKind::Npu
        } else {
            AcceleratorKind::Gpu
        };
        let util_raw = match kind {
            AcceleratorKind::Npu => counters.npu_util,
            AcceleratorKind::Gpu => counters.engine_util + counters.npu_util,
        };
        let utilization = util_raw.clamp(0.0, 100.0) as f32;

        let (mut used, mut total) = memory_for(counters, info, cfg);
        let mut name = info.map(|i| i.description.clone());
        if kind == AcceleratorKind::Gpu && info.is_some_and(AdapterInfo::is_nvidia) {
            match take_vendor_match(total, vendor, &mut vendor_used, cfg) {
                Some(v) => {
                    total = v.memory_total_mb;
                    used = v.memory_used_mb.min(total);
                    name = name.or(Some(v.name));
                }
                None => unpaired_nvidia += 1,
            }
        }
        if used == 0 && utilization > 0.0 && total > 0 {
            used = estimate_used(utilization, total, cfg);
        }

        let index = info.map(|i| i.index);
        let name = name.unwrap_or_else(|| match (kind, index) {
            (AcceleratorKind::Gpu, Some(i)) => format!("GPU {}", i),
            (AcceleratorKind::Npu, Some(i)) => format!("NPU {}", i),
            (AcceleratorKind::Gpu, None) => "GPU".to_string(),
            (AcceleratorKind::Npu, None) => "NPU".to_string(),
        });

        out.push(AcceleratorReading {
            name,
            kind,
            utilization_percent: utilization,
            mem_used_mb: used,
            mem_total_mb: total,
            adapter_index: index,
            adapter_key: Some(*key),
        });
    }

    // Vendor readings nobody claimed are GPUs without OS counters (the
    // proprietary driver on Linux). When an NVIDIA adapter with counters is
    // still unpaired they are most likely that adapter, so they are dropped.
    if unpaired_nvidia == 0 {
        let mut claimed: HashSet<AdapterKey> = resolved.values().map(|a| a.key).collect();
        for (i, v) in vendor.iter().enumerate() {
            if vendor_used.contains(&i) {
                continue;
            }
            let info = vendor_adapter(v, adapters, &mut claimed, cfg);
            out.push(AcceleratorReading {
                name: v.name.clone(),
                kind: AcceleratorKind::Gpu,
                utilization_percent: v.utilization_percent.clamp(0.0, 100.0),
                mem_used_mb: v.memory_used_mb.min(v.memory_total_mb),
                mem_total_mb: v.memory_total_mb,
                adapter_index: info.map(|a| a.index),
                adapter_key: info.map(|a| a.key),
            });
        }
    } else if vendor.len() > vendor_used.len() {
        log::debug!(
            "[telemetry] {} nvidia-smi reading(s) left unmatched next to {} NVIDIA adapter(s) with counters",
            vendor.len() - vendor_used.len(),
            unpaired_nvidia
        );
    }

    sort_readings(&mut out);
    out
}

/// GPUs before NPUs, then by adapter index (unknown last), then by name.
pub fn sort_readings(readings: &mut [AcceleratorReading]) {
    readings.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| match (a.adapter_index, b.adapter_index) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.name.cmp(&b.name))
    });
}
