// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! GPU/accelerator detection lives outside this crate: the concrete
//! NVML-backed probe is in the sibling `runner-accel-probe` crate. This
//! module defines the immutable snapshot the rest of the crate consumes
//! and the trait boundary between them.

/// Immutable snapshot produced once per daemon lifetime (or cached for a
/// short interval by the probe implementation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorInfo {
    /// Accelerator family, e.g. `"cpu"`, `"cuda"`, `"rocm"`, `"metal"`.
    pub library: String,
    /// ABI/ISA-level suffix, e.g. `"v12"`, `"avx2"`. Empty when the family
    /// has no variant distinction.
    pub variant: String,
    pub device_count: u32,
    /// Total VRAM across all devices, in bytes.
    pub total_vram_bytes: u64,
    pub os: String,
    /// Best available CPU ISA flag, e.g. `"avx2"`, used as the CPU
    /// fallback suffix by `VariantSelector` and `LayerPlanner`.
    pub cpu_flag: Option<String>,
}

impl AcceleratorInfo {
    pub fn is_cpu_only(&self) -> bool {
        self.library == "cpu"
    }

    /// VRAM available per device, `V/D` in the layer planner's notation.
    /// Zero devices means zero usable VRAM rather than a division by
    /// zero.
    pub fn vram_per_device(&self) -> u64 {
        if self.device_count == 0 {
            0
        } else {
            self.total_vram_bytes / self.device_count as u64
        }
    }
}

/// Returns a snapshot of the accelerator(s) visible to this process. The
/// concrete implementation (NVML, Metal, ROCm-SMI, ...) lives outside this
/// crate.
pub trait AcceleratorProbe: Send + Sync {
    fn probe(&self) -> crate::Result<AcceleratorInfo>;
}

/// A probe that always reports CPU-only, for daemons with no accelerator
/// support compiled in and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuOnlyProbe;

impl AcceleratorProbe for CpuOnlyProbe {
    fn probe(&self) -> crate::Result<AcceleratorInfo> {
        Ok(AcceleratorInfo {
            library: "cpu".to_string(),
            variant: String::new(),
            device_count: 0,
            total_vram_bytes: 0,
            os: std::env::consts::OS.to_string(),
            cpu_flag: None,
        })
    }
}
