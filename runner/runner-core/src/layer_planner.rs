// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Decides `NumGPU` when the caller left it on auto, and rejects
//! configurations that cannot fit. All arithmetic is in bytes and uses
//! `f64` throughout; the estimate is deliberately an approximation
//! ("empirical constant") rather than an exact accounting of every
//! allocation the runner makes.

use crate::accel::AcceleratorInfo;
use crate::model::ModelDescriptor;
use crate::options::{RuntimeOptions, NUM_GPU_ALL, NUM_GPU_AUTO};
use crate::Result;

/// Bytes per KV element. The historical estimator always uses the f16
/// width here, even when `RuntimeOptions::f16_kv` is false — see
/// DESIGN.md's "f32 KV coefficient" open question.
const KV_BYTES_PER_ELEMENT: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct LayerPlan {
    pub num_gpu: i32,
    pub library: String,
    pub variant: String,
    /// `NumCtx` after clamping into `[4, model.max_context]`.
    pub effective_num_ctx: u64,
    pub warnings: Vec<String>,
}

pub struct LayerPlanner;

impl LayerPlanner {
    pub fn plan(model: &ModelDescriptor, accel: &AcceleratorInfo, opts: &RuntimeOptions) -> Result<LayerPlan> {
        opts.validate()?;

        let mut warnings = Vec::new();
        let effective_num_ctx = clamp_context(opts.num_ctx, model.max_context, &mut warnings);

        let kv = kv_cache_bytes(model, effective_num_ctx);
        let graph = graph_overhead_bytes(model, kv);
        let file_size = model.file_size as f64;

        let plan = if accel.os == "darwin" {
            plan_darwin(accel, opts, file_size, kv, graph)
        } else {
            plan_other(accel, opts, file_size, kv, graph, model.layer_count)
        };

        Ok(LayerPlan {
            num_gpu: plan.0,
            library: plan.1,
            variant: plan.2,
            effective_num_ctx,
            warnings,
        })
    }
}

/// `kv = 2 * 2 * C * L * E * Hkv / H` bytes: two tensors (K and V), two
/// bytes per f16 element, one cache per request.
fn kv_cache_bytes(model: &ModelDescriptor, effective_num_ctx: u64) -> f64 {
    let h = model.head_count.max(1) as f64;
    2.0 * KV_BYTES_PER_ELEMENT
        * effective_num_ctx as f64
        * model.layer_count as f64
        * model.embedding_dim as f64
        * model.kv_head_count as f64
        / h
}

/// `graph ~= GQA * kv / 6`, an empirical constant isolated so it is
/// tunable independently of the KV estimate.
fn graph_overhead_bytes(model: &ModelDescriptor, kv: f64) -> f64 {
    model.gqa_factor() * kv / 6.0
}

fn cpu_fallback_variant(accel: &AcceleratorInfo) -> String {
    accel.cpu_flag.clone().unwrap_or_default()
}

/// Returns `(num_gpu, library, variant)`.
fn plan_darwin(accel: &AcceleratorInfo, opts: &RuntimeOptions, file_size: f64, kv: f64, graph: f64) -> (i32, String, String) {
    if opts.num_gpu == 0 {
        return (0, "cpu".to_string(), cpu_fallback_variant(accel));
    }
    let vram = accel.total_vram_bytes as f64;
    if file_size + kv + graph > vram {
        (0, "cpu".to_string(), cpu_fallback_variant(accel))
    } else {
        (NUM_GPU_ALL, accel.library.clone(), accel.variant.clone())
    }
}

fn plan_other(
    accel: &AcceleratorInfo,
    opts: &RuntimeOptions,
    file_size: f64,
    kv: f64,
    graph: f64,
    layer_count: u64,
) -> (i32, String, String) {
    if accel.is_cpu_only() {
        return (0, "cpu".to_string(), cpu_fallback_variant(accel));
    }
    if opts.num_gpu == 0 {
        return (0, "cpu".to_string(), cpu_fallback_variant(accel));
    }
    if opts.num_gpu > 0 && opts.num_gpu != NUM_GPU_AUTO {
        return (opts.num_gpu, accel.library.clone(), accel.variant.clone());
    }

    let device_count = accel.device_count.max(1) as f64;
    let avg = accel.vram_per_device() as f64;
    let max_layers = (layer_count + 1) as f64;
    let denom = kv + file_size / device_count;
    let layers = if denom <= 0.0 { 0.0 } else { max_layers * (avg - graph) / denom };
    let layers = layers.clamp(0.0, max_layers);
    let layers_floor = layers.floor();

    let feasible = layers_floor > 0.0 && graph + kv * layers_floor / max_layers <= avg;
    if !feasible {
        (0, "cpu".to_string(), cpu_fallback_variant(accel))
    } else {
        (layers_floor as i32, accel.library.clone(), accel.variant.clone())
    }
}

fn clamp_context(requested: u64, model_max: u64, warnings: &mut Vec<String>) -> u64 {
    if requested > model_max {
        warnings.push(format!(
            "requested context {requested} exceeds model maximum {model_max}, clamping down"
        ));
        model_max
    } else if requested < 4 {
        4
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(layer_count: u64, max_context: u64) -> ModelDescriptor {
        ModelDescriptor {
            file_path: "model.gguf".into(),
            file_size: 0,
            layer_count,
            embedding_dim: 4096,
            head_count: 32,
            kv_head_count: 8,
            max_context,
            vision_projector: None,
            lora_adapter: None,
        }
    }

    fn accel(library: &str, os: &str, device_count: u32, total_vram_bytes: u64) -> AcceleratorInfo {
        AcceleratorInfo {
            library: library.to_string(),
            variant: "v12".to_string(),
            device_count,
            total_vram_bytes,
            os: os.to_string(),
            cpu_flag: Some("avx2".to_string()),
        }
    }

    #[test]
    fn clamps_requested_context_to_model_max() {
        let m = model(32, 2048);
        let a = accel("cpu", "linux", 0, 0);
        let mut opts = RuntimeOptions::default();
        opts.num_ctx = 8192;
        let plan = LayerPlanner::plan(&m, &a, &opts).unwrap();
        assert_eq!(plan.effective_num_ctx, 2048);
        assert_eq!(plan.warnings.len(), 1);
    }

    /// Darwin fallback: S=10GB, kv=2GB, graph=0.4GB, V=8GB.
    #[test]
    fn darwin_fallback_splits_layers_between_gpu_and_cpu() {
        let gb = 1_000_000_000u64;
        // Solve for embedding/layer/context such that kv ~= 2GB with
        // head_count == kv_head_count (GQA == 1) so graph == kv/6 ~= 0.4GB.
        let m = ModelDescriptor {
            file_path: "model.gguf".into(),
            file_size: 10 * gb,
            layer_count: 1,
            embedding_dim: 1,
            head_count: 1,
            kv_head_count: 1,
            max_context: (2_000_000_000u64) / (2 * 2),
            vision_projector: None,
            lora_adapter: None,
        };
        let a = accel("cuda", "darwin", 1, 8 * gb);
        let mut opts = RuntimeOptions::default();
        opts.num_ctx = m.max_context;
        let plan = LayerPlanner::plan(&m, &a, &opts).unwrap();
        assert_eq!(plan.num_gpu, 0);
        assert_eq!(plan.library, "cpu");
        assert_eq!(plan.variant, "avx2");
    }

    #[test]
    fn darwin_honors_explicit_cpu_only() {
        let m = model(32, 2048);
        let a = accel("cuda", "darwin", 1, 8_000_000_000);
        let mut opts = RuntimeOptions::default();
        opts.num_gpu = 0;
        let plan = LayerPlanner::plan(&m, &a, &opts).unwrap();
        assert_eq!(plan.num_gpu, 0);
        assert_eq!(plan.library, "cpu");
    }

    #[test]
    fn darwin_requests_all_layers_when_it_fits() {
        let m = model(32, 2048);
        let a = accel("cuda", "darwin", 1, 64_000_000_000);
        let opts = RuntimeOptions::default();
        let plan = LayerPlanner::plan(&m, &a, &opts).unwrap();
        assert_eq!(plan.num_gpu, NUM_GPU_ALL);
        assert_eq!(plan.library, "cuda");
    }

    #[test]
    fn other_os_forces_cpu_when_probe_is_cpu() {
        let m = model(32, 2048);
        let a = accel("cpu", "linux", 0, 0);
        let opts = RuntimeOptions::default();
        let plan = LayerPlanner::plan(&m, &a, &opts).unwrap();
        assert_eq!(plan.num_gpu, 0);
    }

    #[test]
    fn other_os_honors_explicit_positive_num_gpu() {
        let m = model(32, 2048);
        let a = accel("cuda", "linux", 1, 24_000_000_000);
        let mut opts = RuntimeOptions::default();
        opts.num_gpu = 7;
        let plan = LayerPlanner::plan(&m, &a, &opts).unwrap();
        assert_eq!(plan.num_gpu, 7);
        assert_eq!(plan.library, "cuda");
    }

    #[test]
    fn other_os_auto_fits_within_bounds() {
        let m = model(32, 2048);
        let a = accel("cuda", "linux", 1, 24_000_000_000);
        let opts = RuntimeOptions::default();
        let plan = LayerPlanner::plan(&m, &a, &opts).unwrap();
        assert!(plan.num_gpu >= 0);
        assert!(plan.num_gpu as u64 <= m.layer_count + 1 || plan.num_gpu == NUM_GPU_ALL);
    }

    #[test]
    fn rejects_multiple_lora_adapters() {
        let m = model(32, 2048);
        let a = accel("cpu", "linux", 0, 0);
        let mut opts = RuntimeOptions::default();
        opts.lora_adapters = vec!["a.bin".into(), "b.bin".into()];
        assert!(LayerPlanner::plan(&m, &a, &opts).is_err());
    }
}
