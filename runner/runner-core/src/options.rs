// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use std::path::PathBuf;

/// `-1` (auto), `0` (CPU only), `>0` (exact layer count), or `999` (all
/// layers) — mirrors the historical `NumGPU` sentinel values verbatim
/// rather than modeling them as a richer enum, since `RunnerProcess`
/// forwards the raw integer to the runner's `--n-gpu-layers` flag anyway.
pub const NUM_GPU_AUTO: i32 = -1;
pub const NUM_GPU_ALL: i32 = 999;

#[derive(Debug, Clone)]
pub struct SamplingOptions {
    pub temperature: Option<f32>,
    pub top_k: Option<i32>,
    pub top_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub repeat_last_n: Option<i32>,
    pub mirostat: Option<i32>,
    pub mirostat_tau: Option<f32>,
    pub mirostat_eta: Option<f32>,
    pub seed: Option<i32>,
    pub stop: Vec<String>,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            top_k: None,
            top_p: None,
            repeat_penalty: None,
            repeat_last_n: None,
            mirostat: None,
            mirostat_tau: None,
            mirostat_eta: None,
            seed: None,
            stop: Vec::new(),
        }
    }
}

/// Requested output format. `Json` injects the embedded grammar constant
/// as the runner's `grammar` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Requested context window; clamped into `[4, model.max_context]` by
    /// `LayerPlanner::clamp_context`.
    pub num_ctx: u64,
    pub num_batch: u32,
    /// `-1`=auto, `0`=CPU only, `>0`=exact, `999`=all. Use
    /// [`NUM_GPU_AUTO`] / [`NUM_GPU_ALL`] for the named sentinels.
    pub num_gpu: i32,
    pub main_gpu: u32,
    pub num_thread: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub use_numa: bool,
    /// KV cache dtype: `true` = f16, `false` = f32.
    pub f16_kv: bool,
    pub rope_freq_base: Option<f32>,
    pub rope_freq_scale: Option<f32>,
    pub sampling: SamplingOptions,
    pub format: OutputFormat,
    pub lora_adapters: Vec<PathBuf>,
    pub vision_projectors: Vec<PathBuf>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            num_ctx: 2048,
            num_batch: 512,
            num_gpu: NUM_GPU_AUTO,
            main_gpu: 0,
            num_thread: 0,
            use_mmap: true,
            use_mlock: false,
            use_numa: false,
            f16_kv: true,
            rope_freq_base: None,
            rope_freq_scale: None,
            sampling: SamplingOptions::default(),
            format: OutputFormat::default(),
            lora_adapters: Vec::new(),
            vision_projectors: Vec::new(),
        }
    }
}

impl RuntimeOptions {
    /// Configuration errors that don't depend on the resolved model:
    /// at most one LoRA adapter and one vision projector are ever
    /// forwarded.
    pub fn validate(&self) -> crate::Result<()> {
        if self.lora_adapters.len() > 1 {
            return Err(crate::RunnerError::Config(
                "at most one LoRA adapter is supported".to_string(),
            ));
        }
        if self.vision_projectors.len() > 1 {
            return Err(crate::RunnerError::Config(
                "at most one vision projector is supported".to_string(),
            ));
        }
        Ok(())
    }
}
