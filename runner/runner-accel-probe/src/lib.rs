// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Concrete [`AcceleratorProbe`] for `runner-core`: tries NVML first,
//! falls back to a Metal branch on macOS, and falls further back to
//! CPU-only with ISA detection via `raw-cpuid` for the fallback suffix
//! `VariantSelector` and `LayerPlanner` both consume.

use runner_core::accel::{AcceleratorInfo, AcceleratorProbe};
use runner_core::Result;

/// Picks NVML on non-macOS hosts, Metal on macOS, and CPU-only when
/// neither is available. Matches `runner-core::layer_planner`'s
/// `accel.os == "darwin"` branch by normalizing `std::env::consts::OS`'s
/// `"macos"` to `"darwin"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAcceleratorProbe;

impl AcceleratorProbe for HostAcceleratorProbe {
    fn probe(&self) -> Result<AcceleratorInfo> {
        if cfg!(target_os = "macos") {
            return Ok(probe_metal());
        }
        if let Some(info) = probe_nvml() {
            return Ok(info);
        }
        Ok(probe_cpu_only())
    }
}

fn normalize_os() -> String {
    match std::env::consts::OS {
        "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}

fn probe_nvml() -> Option<AcceleratorInfo> {
    let nvml = nvml_wrapper::Nvml::init().ok()?;
    let count = nvml.device_count().ok()?;
    if count == 0 {
        return None;
    }

    let mut total_vram_bytes = 0u64;
    for i in 0..count {
        if let Ok(device) = nvml.device_by_index(i) {
            if let Ok(mem) = device.memory_info() {
                total_vram_bytes += mem.total;
            }
        }
    }

    // CUDA's driver-version encoding is `major * 1000 + minor * 10`.
    let major = nvml.sys_cuda_driver_version().map(|v| v / 1000).unwrap_or(0);

    Some(AcceleratorInfo {
        library: "cuda".to_string(),
        variant: format!("v{major}"),
        device_count: count,
        total_vram_bytes,
        os: normalize_os(),
        cpu_flag: detect_cpu_flag(),
    })
}

fn probe_metal() -> AcceleratorInfo {
    AcceleratorInfo {
        library: "metal".to_string(),
        variant: String::new(),
        device_count: 1,
        total_vram_bytes: macos_unified_memory_bytes(),
        os: normalize_os(),
        cpu_flag: detect_cpu_flag(),
    }
}

fn probe_cpu_only() -> AcceleratorInfo {
    AcceleratorInfo {
        library: "cpu".to_string(),
        variant: String::new(),
        device_count: 0,
        total_vram_bytes: 0,
        os: normalize_os(),
        cpu_flag: detect_cpu_flag(),
    }
}

/// Apple Silicon has no separate VRAM pool; `hw.memsize` (unified memory)
/// is the closest analog `LayerPlanner`'s fit check can use. No NVML
/// equivalent exists for this on macOS, so this shells out to `sysctl`
/// rather than pulling in an IOKit binding for one value.
fn macos_unified_memory_bytes() -> u64 {
    std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

/// Best available ISA suffix for the CPU fallback variant
/// (`cpu_avx2`, ...). `None` when no AVX-family feature is present.
fn detect_cpu_flag() -> Option<String> {
    let cpuid = raw_cpuid::CpuId::new();
    let features = cpuid.get_feature_info()?;
    if !features.has_avx() {
        return None;
    }
    let extended = cpuid.get_extended_feature_info();
    if extended.as_ref().is_some_and(|e| e.has_avx512f()) {
        Some("avx512".to_string())
    } else if extended.as_ref().is_some_and(|e| e.has_avx2()) {
        Some("avx2".to_string())
    } else {
        Some("avx".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_os_maps_macos_to_darwin() {
        assert_ne!(normalize_os(), "macos");
    }

    #[test]
    fn probe_never_fails() {
        assert!(HostAcceleratorProbe.probe().is_ok());
    }

    #[test]
    fn cpu_only_probe_has_no_devices() {
        let info = probe_cpu_only();
        assert_eq!(info.device_count, 0);
        assert_eq!(info.library, "cpu");
    }
}
