// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! The single entry point HTTP handlers call through: resolve a model,
//! plan and spawn (or reuse) its runner, and serialize requests into
//! that runner via a fair FIFO. `RunnerProcess`/`StreamAdapter` do the
//! actual I/O; this module is the "spawn, probe, tear down" orchestration
//! around them. `tokio::sync::Mutex` gives the fair queue for free since
//! its waiters are woken in acquire order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::accel::{AcceleratorInfo, AcceleratorProbe};
use crate::config::RunnerConfig;
use crate::layer_planner::LayerPlanner;
use crate::model::{ModelDescriptor, ModelIntrospector};
use crate::options::RuntimeOptions;
use crate::payload_store::PayloadStore;
use crate::runner_process::RunnerProcess;
use crate::stream_adapter::{StreamAdapter, TokenEvent};
use crate::variant::VariantSelector;
use crate::{Result, RunnerError};

/// The subset of `RuntimeOptions` that changes what gets spawned. A new
/// request whose signature differs from the live runner's triggers close
/// + respawn ("model change").
#[derive(Debug, Clone, PartialEq)]
struct PlanSignature {
    num_ctx: u64,
    num_batch: u32,
    num_gpu: i32,
    main_gpu: u32,
    num_thread: u32,
    use_mmap: bool,
    use_mlock: bool,
    use_numa: bool,
    f16_kv: bool,
    rope_freq_base: Option<u32>,
    rope_freq_scale: Option<u32>,
    lora_adapters: Vec<PathBuf>,
    vision_projectors: Vec<PathBuf>,
}

impl PlanSignature {
    fn of(opts: &RuntimeOptions) -> Self {
        Self {
            num_ctx: opts.num_ctx,
            num_batch: opts.num_batch,
            num_gpu: opts.num_gpu,
            main_gpu: opts.main_gpu,
            num_thread: opts.num_thread,
            use_mmap: opts.use_mmap,
            use_mlock: opts.use_mlock,
            use_numa: opts.use_numa,
            f16_kv: opts.f16_kv,
            rope_freq_base: opts.rope_freq_base.map(f32::to_bits),
            rope_freq_scale: opts.rope_freq_scale.map(f32::to_bits),
            lora_adapters: opts.lora_adapters.clone(),
            vision_projectors: opts.vision_projectors.clone(),
        }
    }
}

struct ManagedRunner {
    process: RunnerProcess,
    signature: PlanSignature,
    queue: Mutex<()>,
    last_used: Mutex<Instant>,
}

impl ManagedRunner {
    async fn touch(&self) {
        *self.last_used.lock().await = Instant::now();
    }

    async fn idle_for(&self) -> std::time::Duration {
        self.last_used.lock().await.elapsed()
    }

    /// Acquires this runner's fair FIFO queue permit, recording how long
    /// the caller waited behind earlier requests.
    async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        let start = Instant::now();
        let permit = self.queue.lock().await;
        crate::metrics::SCHEDULER_QUEUE_WAIT.observe(start.elapsed().as_secs_f64());
        permit
    }
}

/// Owns every live `RunnerProcess`, keyed by the caller's model reference
/// string. The only component permitted to create or destroy a
/// `RunnerProcess`.
pub struct RequestScheduler {
    introspector: Arc<dyn ModelIntrospector>,
    probe: Arc<dyn AcceleratorProbe>,
    payload: Arc<PayloadStore>,
    config: RunnerConfig,
    runners: RwLock<HashMap<String, Arc<ManagedRunner>>>,
}

impl RequestScheduler {
    pub fn new(
        introspector: Arc<dyn ModelIntrospector>,
        probe: Arc<dyn AcceleratorProbe>,
        payload: Arc<PayloadStore>,
        config: RunnerConfig,
    ) -> Self {
        Self { introspector, probe, payload, config, runners: RwLock::new(HashMap::new()) }
    }

    /// Drives one completion request end to end, invoking `on_event` for
    /// every token and once for the terminal `done` event. Injects the
    /// embedded JSON grammar when `opts.format` is `Json`. `images` is
    /// forwarded verbatim as the runner's `image_data` list; pair with a
    /// `--mmproj` vision projector in `opts.vision_projectors`.
    pub async fn run_completion(
        &self,
        model_ref: &str,
        opts: &RuntimeOptions,
        prompt: &str,
        images: &[ImageData],
        cancel: &CancellationToken,
        on_event: impl FnMut(TokenEvent),
    ) -> Result<()> {
        let runner = self.get_or_spawn(model_ref, opts).await?;
        let _permit = runner.acquire().await;
        crate::metrics::COMPLETION_REQUESTS.inc();

        let mut body = completion_body(prompt, images, opts);
        if opts.format == crate::options::OutputFormat::Json {
            body["grammar"] = serde_json::Value::String(crate::grammar::JSON_GRAMMAR.to_string());
        }

        let adapter = StreamAdapter::new(&runner.process, &self.config);
        let result = adapter.run_completion(body, cancel, on_event).await;
        runner.touch().await;

        if let Err(RunnerError::RunnerCrashed(_)) = &result {
            crate::metrics::RUNNER_CRASHES.inc();
            self.evict(model_ref).await;
        }
        result
    }

    pub async fn embedding(&self, model_ref: &str, opts: &RuntimeOptions, content: &str, cancel: &CancellationToken) -> Result<Vec<f64>> {
        let runner = self.get_or_spawn(model_ref, opts).await?;
        let _permit = runner.acquire().await;
        let out = runner.process.embedding(content, cancel).await;
        runner.touch().await;
        out
    }

    pub async fn tokenize(&self, model_ref: &str, opts: &RuntimeOptions, content: &str, cancel: &CancellationToken) -> Result<Vec<i64>> {
        let runner = self.get_or_spawn(model_ref, opts).await?;
        let _permit = runner.acquire().await;
        let out = runner.process.tokenize(content, cancel).await;
        runner.touch().await;
        out
    }

    pub async fn detokenize(&self, model_ref: &str, opts: &RuntimeOptions, tokens: &[i64], cancel: &CancellationToken) -> Result<String> {
        let runner = self.get_or_spawn(model_ref, opts).await?;
        let _permit = runner.acquire().await;
        let out = runner.process.detokenize(tokens, cancel).await;
        runner.touch().await;
        out
    }

    /// Closes and drops every runner idle past `config.idle_timeout`. A
    /// daemon calls this on a periodic tick; it is not self-driving so
    /// tests can call it deterministically instead of racing a timer.
    pub async fn reap_idle(&self) {
        let mut dead = Vec::new();
        {
            let runners = self.runners.read().await;
            for (key, runner) in runners.iter() {
                if runner.idle_for().await >= self.config.idle_timeout {
                    dead.push(key.clone());
                }
            }
        }
        for key in dead {
            self.evict(&key).await;
        }
    }

    /// Closes every live runner. Call at daemon shutdown after
    /// `PayloadStore::cleanup`.
    pub async fn shutdown(&self) {
        let mut runners = self.runners.write().await;
        for (_, runner) in runners.drain() {
            let _ = runner.process.close().await;
            crate::metrics::ACTIVE_RUNNERS.dec();
        }
    }

    async fn evict(&self, model_ref: &str) {
        let removed = self.runners.write().await.remove(model_ref);
        if let Some(runner) = removed {
            let _ = runner.process.close().await;
            crate::metrics::ACTIVE_RUNNERS.dec();
        }
    }

    async fn get_or_spawn(&self, model_ref: &str, opts: &RuntimeOptions) -> Result<Arc<ManagedRunner>> {
        let signature = PlanSignature::of(opts);

        if let Some(runner) = self.runners.read().await.get(model_ref) {
            if runner.signature == signature {
                return Ok(runner.clone());
            }
        }

        // Signature mismatch or no runner yet: take the write lock, recheck
        // (another caller may have raced us), then spawn.
        let mut runners = self.runners.write().await;
        if let Some(runner) = runners.get(model_ref) {
            if runner.signature == signature {
                return Ok(runner.clone());
            }
            let stale = runners.remove(model_ref).unwrap();
            let _ = stale.process.close().await;
            crate::metrics::ACTIVE_RUNNERS.dec();
        }

        let runner = Arc::new(self.spawn_for(model_ref, opts, signature).await?);
        runners.insert(model_ref.to_string(), runner.clone());
        Ok(runner)
    }

    async fn spawn_for(&self, model_ref: &str, opts: &RuntimeOptions, signature: PlanSignature) -> Result<ManagedRunner> {
        let start = Instant::now();
        crate::metrics::RUNNER_SPAWNS.inc();

        let model = self.introspector.introspect(Path::new(model_ref))?;
        let accel = self.probe.probe()?;
        let plan = LayerPlanner::plan(&model, &accel, opts)?;
        for warning in &plan.warnings {
            tracing::warn!(model = model_ref, warning, "layer planner warning");
        }

        // `VariantSelector` must see the planner's resolved library/variant
        // (e.g. the Darwin-fallback-to-CPU decision), not the raw probe —
        // otherwise a CPU fallback still orders GPU candidates first.
        let resolved_accel = AcceleratorInfo { library: plan.library.clone(), variant: plan.variant.clone(), ..accel.clone() };
        let candidates = VariantSelector::select(&resolved_accel, self.payload.available());

        // Likewise `RunnerProcess` must be spawned with `NumGPU` resolved by
        // the planner, not the caller's raw `-1`/auto request.
        let mut resolved_opts = opts.clone();
        resolved_opts.num_gpu = plan.num_gpu;

        let process = self.spawn_first_healthy(&model, &resolved_opts, &plan, &candidates).await;
        match process {
            Ok(process) => {
                crate::metrics::RUNNER_SPAWN_DURATION.observe(start.elapsed().as_secs_f64());
                crate::metrics::ACTIVE_RUNNERS.inc();
                Ok(ManagedRunner { process, signature, queue: Mutex::new(()), last_used: Mutex::new(Instant::now()) })
            }
            Err(e) => {
                crate::metrics::RUNNER_SPAWN_FAILURES.inc();
                Err(e)
            }
        }
    }

    /// Tries each candidate variant in order; the first that becomes
    /// healthy wins and the rest are never attempted.
    async fn spawn_first_healthy(
        &self,
        model: &ModelDescriptor,
        opts: &RuntimeOptions,
        plan: &crate::layer_planner::LayerPlan,
        candidates: &[String],
    ) -> Result<RunnerProcess> {
        let mut last_err = None;
        for tag in candidates {
            let Some(variant_dir) = self.payload.available().get(tag) else { continue };
            let binary_path = variant_dir.join(runner_binary_file_name());
            match RunnerProcess::spawn(model, opts, plan.effective_num_ctx, tag, variant_dir, &binary_path, &self.config).await {
                Ok(process) => return Ok(process),
                Err(e) => {
                    tracing::warn!(variant = %tag, error = %e, "runner variant failed to start, trying next candidate");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(RunnerError::NoBackend))
    }
}

fn runner_binary_file_name() -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", PayloadStore::runner_binary_name())
    } else {
        PayloadStore::runner_binary_name().to_string()
    }
}

/// One entry of the runner's `image_data` list: `data` is the
/// base64-encoded image payload, `id` is the prompt-embedded reference
/// (`[img-<id>]`) the runner substitutes during tokenization.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageData {
    pub data: String,
    pub id: i64,
}

fn completion_body(prompt: &str, images: &[ImageData], opts: &RuntimeOptions) -> serde_json::Value {
    let mut body = serde_json::json!({
        "prompt": prompt,
        "stream": true,
        "n_predict": -1,
        "n_keep": 0,
        "stop": opts.sampling.stop,
        "image_data": images,
    });
    if let Some(v) = opts.sampling.temperature {
        body["temperature"] = serde_json::json!(v);
    }
    if let Some(v) = opts.sampling.top_k {
        body["top_k"] = serde_json::json!(v);
    }
    if let Some(v) = opts.sampling.top_p {
        body["top_p"] = serde_json::json!(v);
    }
    if let Some(v) = opts.sampling.repeat_penalty {
        body["repeat_penalty"] = serde_json::json!(v);
    }
    if let Some(v) = opts.sampling.repeat_last_n {
        body["repeat_last_n"] = serde_json::json!(v);
    }
    if let Some(v) = opts.sampling.mirostat {
        body["mirostat"] = serde_json::json!(v);
    }
    if let Some(v) = opts.sampling.mirostat_tau {
        body["mirostat_tau"] = serde_json::json!(v);
    }
    if let Some(v) = opts.sampling.mirostat_eta {
        body["mirostat_eta"] = serde_json::json!(v);
    }
    if let Some(v) = opts.sampling.seed {
        body["seed"] = serde_json::json!(v);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::CpuOnlyProbe;

    struct FixedIntrospector(ModelDescriptor);

    impl ModelIntrospector for FixedIntrospector {
        fn introspect(&self, _model_path: &Path) -> Result<ModelDescriptor> {
            Ok(self.0.clone())
        }
    }

    struct MissingIntrospector;

    impl ModelIntrospector for MissingIntrospector {
        fn introspect(&self, model_path: &Path) -> Result<ModelDescriptor> {
            Err(RunnerError::NotFound(model_path.display().to_string()))
        }
    }

    fn model() -> ModelDescriptor {
        ModelDescriptor {
            file_path: "model.gguf".into(),
            file_size: 0,
            layer_count: 32,
            embedding_dim: 4096,
            head_count: 32,
            kv_head_count: 8,
            max_context: 4096,
            vision_projector: None,
            lora_adapter: None,
        }
    }

    /// Mirrors `spawn_for`'s resolution step directly: a GPU probe whose
    /// footprint doesn't fit must narrow `VariantSelector`'s candidates to
    /// CPU only, not GPU-then-CPU — the bug this regression test pins was
    /// selecting candidates from the raw probe instead of the planner's
    /// resolved library/variant.
    #[test]
    fn variant_selection_uses_planners_resolved_cpu_fallback_not_raw_probe() {
        let tiny_vram_model = ModelDescriptor {
            file_path: "model.gguf".into(),
            file_size: 10_000_000_000,
            layer_count: 32,
            embedding_dim: 4096,
            head_count: 32,
            kv_head_count: 8,
            max_context: 4096,
            vision_projector: None,
            lora_adapter: None,
        };
        let probed_accel = AcceleratorInfo {
            library: "cuda".to_string(),
            variant: "v12".to_string(),
            device_count: 1,
            total_vram_bytes: 1_000,
            os: "linux".to_string(),
            cpu_flag: Some("avx2".to_string()),
        };
        let opts = RuntimeOptions::default();
        let plan = LayerPlanner::plan(&tiny_vram_model, &probed_accel, &opts).unwrap();
        assert_eq!(plan.library, "cpu", "footprint does not fit, planner must fall back to cpu");

        let resolved_accel = AcceleratorInfo { library: plan.library.clone(), variant: plan.variant.clone(), ..probed_accel.clone() };
        let available: HashMap<String, PathBuf> =
            ["cpu", "cpu_avx2", "cuda_v12"].iter().map(|t| (t.to_string(), PathBuf::from(t))).collect();

        let candidates = VariantSelector::select(&resolved_accel, &available);
        assert_eq!(candidates, vec!["cpu_avx2"]);

        // The raw probe, left unresolved, would have produced the wrong
        // (GPU-first) candidate order — proving the fix is load-bearing.
        let raw_candidates = VariantSelector::select(&probed_accel, &available);
        assert_ne!(candidates, raw_candidates);
    }

    #[test]
    fn spawned_opts_carry_planners_resolved_num_gpu_not_callers_auto() {
        let model = ModelDescriptor {
            file_path: "model.gguf".into(),
            file_size: 1_000_000,
            layer_count: 32,
            embedding_dim: 4096,
            head_count: 32,
            kv_head_count: 8,
            max_context: 4096,
            vision_projector: None,
            lora_adapter: None,
        };
        let accel = AcceleratorInfo {
            library: "cuda".to_string(),
            variant: "v12".to_string(),
            device_count: 1,
            total_vram_bytes: 24_000_000_000,
            os: "linux".to_string(),
            cpu_flag: Some("avx2".to_string()),
        };
        let mut opts = RuntimeOptions::default();
        opts.num_gpu = crate::options::NUM_GPU_AUTO;
        let plan = LayerPlanner::plan(&model, &accel, &opts).unwrap();
        assert_ne!(plan.num_gpu, crate::options::NUM_GPU_AUTO, "auto must resolve to a concrete layer count");

        let mut resolved_opts = opts.clone();
        resolved_opts.num_gpu = plan.num_gpu;
        assert_eq!(resolved_opts.num_gpu, plan.num_gpu);
        assert_ne!(resolved_opts.num_gpu, opts.num_gpu);
    }

    #[tokio::test]
    async fn resolving_a_missing_model_surfaces_not_found() {
        let payload = Arc::new(PayloadStore::init_for(&std::env::temp_dir().join("runner-core-sched-test"), "nonexistent-os", "nonexistent-arch").await.unwrap());
        let scheduler = RequestScheduler::new(
            Arc::new(MissingIntrospector),
            Arc::new(CpuOnlyProbe),
            payload.clone(),
            RunnerConfig::default(),
        );
        let cancel = CancellationToken::new();
        let err = scheduler.run_completion("missing.gguf", &RuntimeOptions::default(), "hi", &[], &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, RunnerError::NotFound(_)));
        payload.cleanup().unwrap();
    }

    #[tokio::test]
    async fn no_backend_when_no_variants_are_available() {
        let payload = Arc::new(PayloadStore::init_for(&std::env::temp_dir().join("runner-core-sched-test-2"), "nonexistent-os", "nonexistent-arch").await.unwrap());
        let scheduler = RequestScheduler::new(
            Arc::new(FixedIntrospector(model())),
            Arc::new(CpuOnlyProbe),
            payload.clone(),
            RunnerConfig::default(),
        );
        let cancel = CancellationToken::new();
        let err = scheduler.run_completion("model.gguf", &RuntimeOptions::default(), "hi", &[], &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, RunnerError::NoBackend));
        payload.cleanup().unwrap();
    }

    #[test]
    fn plan_signature_changes_when_num_ctx_changes() {
        let mut a = RuntimeOptions::default();
        let b_sig = {
            let mut b = RuntimeOptions::default();
            b.num_ctx = 8192;
            PlanSignature::of(&b)
        };
        a.num_ctx = 2048;
        assert_ne!(PlanSignature::of(&a), b_sig);
    }

    #[test]
    fn completion_body_carries_sampling_and_stop_list() {
        let mut opts = RuntimeOptions::default();
        opts.sampling.temperature = Some(0.7);
        opts.sampling.stop = vec!["\n".to_string()];
        let body = completion_body("hello", &[], &opts);
        assert_eq!(body["prompt"], "hello");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["stop"][0], "\n");
        assert_eq!(body["image_data"], serde_json::json!([]));
    }

    #[test]
    fn completion_body_forwards_image_data() {
        let opts = RuntimeOptions::default();
        let images = vec![ImageData { data: "base64bytes".to_string(), id: 1 }];
        let body = completion_body("describe [img-1]", &images, &opts);
        assert_eq!(body["image_data"][0]["id"], 1);
        assert_eq!(body["image_data"][0]["data"], "base64bytes");
    }
}
