use std::path::{Path, PathBuf};
use std::process::Command;
use sysinfo::{Disks, System};

use super::{
    AdapterEnumerator, AdapterInfo, AdapterKey, CounterKind, CounterSample, CounterSource, HostSampler,
    HostReading, Samplers, VendorGpuReading, VendorSampler,
};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const COUNTER_PATHS: &[&str] = &[
    r"\GPU Engine(*)\Utilization Percentage",
    r"\GPU Adapter Memory(*)\Dedicated Usage",
    r"\GPU Adapter Memory(*)\Dedicated Limit",
    r"\GPU Adapter Memory(*)\Shared Usage",
    r"\GPU Adapter Memory(*)\Shared Limit",
    r"\NPU Engine(*)\Utilization Percentage",
];

fn hidden_command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Parse `path|value` lines printed by the `Get-Counter` script.
///
/// Paths look like
/// `\\host\gpu engine(pid_1_luid_0x0_0xd1b5_phys_0_eng_0_engtype_3d)\utilization percentage`.
pub fn parse_counter_output(text: &str) -> Vec<CounterSample> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some((path, value)) = line.trim().rsplit_once('|') else {
            continue;
        };
        let Ok(value) = value.trim().replace(',', ".").parse::<f64>() else {
            continue;
        };
        let path = path.to_ascii_lowercase();
        let (Some(open), Some(close)) = (path.find('('), path.rfind(')')) else {
            continue;
        };
        if close <= open {
            continue;
        }
        let family = &path[..open];
        let counter = &path[close + 1..];
        let kind = if family.ends_with("npu engine") && counter.contains("utilization") {
            CounterKind::NpuUtilization
        } else if family.ends_with("gpu engine") && counter.contains("utilization") {
            CounterKind::EngineUtilization
        } else if counter.ends_with("dedicated usage") {
            CounterKind::DedicatedUsage
        } else if counter.ends_with("dedicated limit") {
            CounterKind::DedicatedLimit
        } else if counter.ends_with("shared usage") {
            CounterKind::SharedUsage
        } else if counter.ends_with("shared limit") {
            CounterKind::SharedLimit
        } else {
            continue;
        };
        out.push(CounterSample {
            instance: path[open + 1..close].to_string(),
            kind,
            value,
        });
    }
    out
}

/// Windows performance counters, one PowerShell round-trip per tick.
pub struct PowerShellCounters {
    script: String,
}

impl Default for PowerShellCounters {
    fn default() -> Self {
        let paths = COUNTER_PATHS
            .iter()
            .map(|p| format!("'{}'", p))
            .collect::<Vec<_>>()
            .join(",");
        let script = format!(
            "(Get-Counter -Counter {} -ErrorAction SilentlyContinue).CounterSamples | \
             ForEach-Object {{ [string]::Format([Globalization.CultureInfo]::InvariantCulture, '{{0}}|{{1}}', $_.Path, $_.CookedValue) }}",
            paths
        );
        Self { script }
    }
}

impl CounterSource for PowerShellCounters {
    fn sample(&mut self) -> Vec<CounterSample> {
        let out = hidden_command("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", &self.script])
            .output();
        match out {
            Ok(out) => parse_counter_output(&String::from_utf8_lossy(&out.stdout)),
            Err(e) => {
                log::debug!("[telemetry] Get-Counter failed: {}", e);
                Vec::new()
            }
        }
    }
}

fn read_number(path: &Path) -> Option<f64> {
    std::fs::read_to_string(path).ok()?.trim().parse::<f64>().ok()
}

/// `cardN` directories under a DRM class root, with their card number.
fn drm_cards(root: &Path) -> Vec<(u32, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut cards: Vec<(u32, PathBuf)> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let n = name.strip_prefix("card")?.parse::<u32>().ok()?;
            Some((n, e.path()))
        })
        .collect();
    cards.sort_by_key(|(n, _)| *n);
    cards
}

fn card_key(n: u32) -> AdapterKey {
    AdapterKey::new(0, n)
}

/// Linux DRM cards, reported with the same instance naming as the Windows
/// counters so they group the same way.
pub struct SysfsCounters {
    root: PathBuf,
}

impl SysfsCounters {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsCounters {
    fn default() -> Self {
        Self::new("/sys/class/drm")
    }
}

impl CounterSource for SysfsCounters {
    fn sample(&mut self) -> Vec<CounterSample> {
        let mut out = Vec::new();
        for (n, path) in drm_cards(&self.root) {
            let device = path.join("device");
            let instance = card_key(n).instance_name();
            let files = [
                ("gpu_busy_percent", CounterKind::EngineUtilization),
                ("mem_info_vram_used", CounterKind::DedicatedUsage),
                ("mem_info_vram_total", CounterKind::DedicatedLimit),
            ];
            for (file, kind) in files {
                if let Some(value) = read_number(&device.join(file)) {
                    out.push(CounterSample {
                        instance: instance.clone(),
                        kind,
                        value,
                    });
                }
            }
        }
        out
    }
}

pub struct SysfsAdapters {
    root: PathBuf,
}

impl SysfsAdapters {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsAdapters {
    fn default() -> Self {
        Self::new("/sys/class/drm")
    }
}

/// Parse a sysfs `vendor` file (`0x10de`).
fn parse_vendor_id(text: &str) -> u32 {
    let text = text.trim();
    let hex = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    u32::from_str_radix(hex, 16).unwrap_or(0)
}

fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        0x1002 => "AMD",
        super::NVIDIA_VENDOR_ID => "NVIDIA",
        0x8086 => "Intel",
        _ => "GPU",
    }
}

impl AdapterEnumerator for SysfsAdapters {
    fn enumerate(&self) -> Vec<AdapterInfo> {
        drm_cards(&self.root)
            .into_iter()
            .filter(|(_, path)| path.join("device").exists())
            .map(|(n, path)| {
                let device = path.join("device");
                let vendor_id = std::fs::read_to_string(device.join("vendor"))
                    .map(|v| parse_vendor_id(&v))
                    .unwrap_or(0);
                let description = std::fs::read_to_string(device.join("product_name"))
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| format!("{} GPU (card{})", vendor_name(vendor_id), n));
                AdapterInfo {
                    index: n,
                    description,
                    key: card_key(n),
                    dedicated_memory_bytes: read_number(&device.join("mem_info_vram_total"))
                        .map(|v| v as u64)
                        .unwrap_or(0),
                    vendor_id,
                }
            })
            .collect()
    }
}

#[cfg(target_os = "windows")]
pub struct DxgiAdapters;

#[cfg(target_os = "windows")]
impl AdapterEnumerator for DxgiAdapters {
    fn enumerate(&self) -> Vec<AdapterInfo> {
        use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, IDXGIFactory1, DXGI_ADAPTER_FLAG_SOFTWARE};

        let factory: IDXGIFactory1 = match unsafe { CreateDXGIFactory1() } {
            Ok(f) => f,
            Err(e) => {
                log::warn!("[telemetry] CreateDXGIFactory1 failed: {}", e);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        let mut index = 0u32;
        // EnumAdapters1 fails with DXGI_ERROR_NOT_FOUND past the last adapter.
        while let Ok(adapter) = unsafe { factory.EnumAdapters1(index) } {
            let current = index;
            index += 1;
            let desc = match unsafe { adapter.GetDesc1() } {
                Ok(d) => d,
                Err(e) => {
                    log::debug!("[telemetry] GetDesc1({}) failed: {}", current, e);
                    continue;
                }
            };
            if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
                continue;
            }
            let len = desc
                .Description
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(desc.Description.len());
            out.push(AdapterInfo {
                index: current,
                description: String::from_utf16_lossy(&desc.Description[..len]),
                key: AdapterKey::from_luid(desc.AdapterLuid.LowPart, desc.AdapterLuid.HighPart),
                dedicated_memory_bytes: desc.DedicatedVideoMemory as u64,
                vendor_id: desc.VendorId,
            });
        }
        out
    }
}

/// Parse `name, memory.total, memory.used, utilization.gpu` CSV rows
/// (`--format=csv,noheader,nounits`). Names may contain commas, so the
/// numeric fields are taken from the right.
pub fn parse_nvidia_smi_csv(text: &str) -> Vec<VendorGpuReading> {
    let mut out = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            continue;
        }
        let n = fields.len();
        let (Ok(total), Ok(used)) = (fields[n - 3].parse::<u64>(), fields[n - 2].parse::<u64>()) else {
            continue;
        };
        let utilization = fields[n - 1].parse::<f32>().unwrap_or(0.0);
        let name = fields[..n - 3].join(", ");
        if name.is_empty() {
            continue;
        }
        out.push(VendorGpuReading {
            name,
            memory_total_mb: total,
            memory_used_mb: used,
            utilization_percent: utilization,
        });
    }
    out
}

/// nvidia-smi as a high-precision memory source. Disabled after the first
/// spawn failure so machines without it don't pay for a spawn every tick.
pub struct NvidiaSmi {
    enabled: bool,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl VendorSampler for NvidiaSmi {
    fn read(&mut self) -> Vec<VendorGpuReading> {
        if !self.enabled {
            return Vec::new();
        }
        let out = hidden_command("nvidia-smi")
            .args([
                "--query-gpu=name,memory.total,memory.used,utilization.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output();
        match out {
            Ok(out) if out.status.success() => parse_nvidia_smi_csv(&String::from_utf8_lossy(&out.stdout)),
            Ok(_) => Vec::new(),
            Err(e) => {
                log::info!("[telemetry] nvidia-smi unavailable: {}", e);
                self.enabled = false;
                Vec::new()
            }
        }
    }
}

/// CPU, memory and disk through sysinfo.
pub struct SysinfoHost {
    sys: System,
    disks: Disks,
}

impl Default for SysinfoHost {
    fn default() -> Self {
        let mut sys = System::new();
        // CPU usage is a delta, so prime it once.
        sys.refresh_cpu();
        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl HostSampler for SysinfoHost {
    fn read(&mut self) -> HostReading {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.disks.refresh();

        let (total, available) = self
            .disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
        let disk_percent = if total > 0 {
            Some(((total - available.min(total)) as f64 / total as f64 * 100.0) as f32)
        } else {
            None
        };

        HostReading {
            cpu_percent: self.sys.global_cpu_info().cpu_usage(),
            memory_used_mb: self.sys.used_memory() / 1024 / 1024,
            memory_total_mb: self.sys.total_memory() / 1024 / 1024,
            disk_percent,
        }
    }
}

/// Per-tick sources for the current platform.
pub fn platform_samplers() -> Samplers {
    #[cfg(target_os = "windows")]
    let counters: Box<dyn CounterSource> = Box::new(PowerShellCounters::default());
    #[cfg(not(target_os = "windows"))]
    let counters: Box<dyn CounterSource> = Box::new(SysfsCounters::default());

    Samplers {
        counters,
        vendor: Box::new(NvidiaSmi::default()),
        host: Box::new(SysinfoHost::default()),
    }
}

pub fn platform_adapters() -> Box<dyn AdapterEnumerator> {
    #[cfg(target_os = "windows")]
    {
        Box::new(DxgiAdapters)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Box::new(SysfsAdapters::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counter_output() {
        let text = "\
\\\\desk\\gpu engine(pid_1234_luid_0x00000000_0x0000d1b5_phys_0_eng_0_engtype_3d)\\utilization percentage|12.5
\\\\desk\\gpu adapter memory(luid_0x00000000_0x0000d1b5_phys_0)\\dedicated usage|1073741824
\\\\desk\\gpu adapter memory(luid_0x00000000_0x0000d1b5_phys_0)\\shared usage|0
\\\\desk\\npu engine(pid_9_luid_0x00000000_0x0000a001_phys_0_eng_0_engtype_compute)\\utilization percentage|3,5
\\\\desk\\gpu adapter memory(luid_0x00000000_0x0000d1b5_phys_0)\\total committed|42
garbage line
\\\\desk\\gpu engine(x)\\utilization percentage|not-a-number
";
        let samples = parse_counter_output(text);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].kind, CounterKind::EngineUtilization);
        assert_eq!(samples[0].value, 12.5);
        assert_eq!(
            AdapterKey::parse(&samples[0].instance),
            Some(AdapterKey::new(0, 0xD1B5))
        );
        assert_eq!(samples[1].kind, CounterKind::DedicatedUsage);
        assert_eq!(samples[2].kind, CounterKind::SharedUsage);
        assert_eq!(samples[3].kind, CounterKind::NpuUtilization);
        assert_eq!(samples[3].value, 3.5);
    }

    #[test]
    fn test_parse_nvidia_smi_csv() {
        let text = "NVIDIA GeForce RTX 4090, 24564, 1210, 7\nTesla, Inc. Board, 16384, 0, [N/A]\n\nbroken, row\n";
        let rows = parse_nvidia_smi_csv(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!((rows[0].memory_total_mb, rows[0].memory_used_mb), (24564, 1210));
        assert_eq!(rows[0].utilization_percent, 7.0);
        assert_eq!(rows[1].name, "Tesla, Inc. Board");
        assert_eq!(rows[1].utilization_percent, 0.0);
    }

    fn fake_card(root: &Path, n: u32, files: &[(&str, &str)]) {
        let device = root.join(format!("card{}", n)).join("device");
        std::fs::create_dir_all(&device).unwrap();
        for (name, content) in files {
            std::fs::write(device.join(name), content).unwrap();
        }
    }

    #[test]
    fn test_sysfs_counters_and_adapters() {
        let dir = tempfile::tempdir().unwrap();
        fake_card(
            dir.path(),
            0,
            &[
                ("gpu_busy_percent", "17\n"),
                ("mem_info_vram_used", "536870912\n"),
                ("mem_info_vram_total", "8589934592\n"),
                ("vendor", "0x1002\n"),
            ],
        );
        fake_card(dir.path(), 1, &[("vendor", "0x8086\n")]);
        std::fs::create_dir_all(dir.path().join("card0-DP-1")).unwrap();
        std::fs::create_dir_all(dir.path().join("renderD128")).unwrap();

        let samples = SysfsCounters::new(dir.path()).sample();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| AdapterKey::parse(&s.instance) == Some(AdapterKey::new(0, 0))));

        let adapters = SysfsAdapters::new(dir.path()).enumerate();
        assert_eq!(adapters.len(), 2);
        assert_eq!(adapters[0].description, "AMD GPU (card0)");
        assert_eq!(adapters[0].dedicated_memory_bytes, 8589934592);
        assert_eq!(adapters[1].description, "Intel GPU (card1)");
        assert_eq!(adapters[1].key, AdapterKey::new(0, 1));
        assert_eq!((adapters[0].vendor_id, adapters[1].vendor_id), (0x1002, 0x8086));
        assert!(!adapters[0].is_nvidia());
    }

    #[test]
    fn test_proprietary_nvidia_card_has_no_counters() {
        let dir = tempfile::tempdir().unwrap();
        fake_card(dir.path(), 1, &[("vendor", "0x10de\n")]);

        assert!(SysfsCounters::new(dir.path()).sample().is_empty());
        let adapters = SysfsAdapters::new(dir.path()).enumerate();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].description, "NVIDIA GPU (card1)");
        assert_eq!(adapters[0].dedicated_memory_bytes, 0);
        assert!(adapters[0].is_nvidia());
    }

    #[test]
    fn test_missing_sysfs_root_is_empty() {
        assert!(SysfsCounters::new("/nonexistent/drm").sample().is_empty());
        assert!(SysfsAdapters::new("/nonexistent/drm").enumerate().is_empty());
    }
}
