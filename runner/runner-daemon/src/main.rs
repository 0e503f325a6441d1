// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Thin example binary wiring `runner-core`'s scheduler into a CLI.
//! Outer HTTP routing is out of scope here; this binary only
//! demonstrates the one call a handler would make:
//! `RequestScheduler::run_completion`.

use anyhow::{Context, Result};
use clap::Parser;
use runner_accel_probe::HostAcceleratorProbe;
use runner_core::config::RunnerConfig;
use runner_core::logging::{self, LogStyle};
use runner_core::model::{ModelDescriptor, ModelIntrospector};
use runner_core::options::RuntimeOptions;
use runner_core::payload_store::PayloadStore;
use runner_core::scheduler::RequestScheduler;
use runner_core::RunnerError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(name = "runner-daemon", about = "Example embedding of runner-core")]
struct Args {
    /// Path to the GGUF-style model file.
    model: PathBuf,

    /// Prompt to send as a single completion request, then exit.
    prompt: String,

    #[clap(short = 'l', long = "log", default_value = "info")]
    log_level: String,

    #[clap(long, default_value = "pretty")]
    log_style: String,

    #[clap(long)]
    json_logs: bool,

    /// Working directory runner binaries are extracted into. Defaults to
    /// a process-temp directory.
    #[clap(long)]
    work_dir: Option<PathBuf>,

    /// Path to a TOML file overriding runner-core's defaults.
    #[clap(long)]
    config: Option<PathBuf>,
}

/// Sidecar metadata a real daemon would get from parsing the model file
/// itself (`runner_core::model` calls that an out-of-scope external
/// collaborator). This binary reads a `<model>.json` sidecar instead, so
/// the example has something concrete to introspect without vendoring a
/// GGUF parser.
#[derive(Debug, serde::Deserialize)]
struct SidecarMetadata {
    file_size: u64,
    layer_count: u64,
    embedding_dim: u64,
    head_count: u64,
    kv_head_count: u64,
    max_context: u64,
}

struct SidecarIntrospector;

impl ModelIntrospector for SidecarIntrospector {
    fn introspect(&self, model_path: &Path) -> runner_core::Result<ModelDescriptor> {
        let sidecar = model_path.with_extension("json");
        let text = std::fs::read_to_string(&sidecar).map_err(|_| {
            RunnerError::NotFound(format!(
                "model {} (expected sidecar metadata at {})",
                model_path.display(),
                sidecar.display()
            ))
        })?;
        let meta: SidecarMetadata = serde_json::from_str(&text)
            .map_err(|e| RunnerError::Config(format!("invalid sidecar metadata {}: {e}", sidecar.display())))?;
        Ok(ModelDescriptor {
            file_path: model_path.to_path_buf(),
            file_size: meta.file_size,
            layer_count: meta.layer_count,
            embedding_dim: meta.embedding_dim,
            head_count: meta.head_count,
            kv_head_count: meta.kv_head_count,
            max_context: meta.max_context,
            vision_projector: None,
            lora_adapter: None,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_style: LogStyle = args.log_style.parse().map_err(anyhow::Error::msg)?;
    logging::init(&args.log_level, log_style, args.json_logs)?;

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            RunnerConfig::from_toml_str(&text)?
        }
        None => RunnerConfig::default(),
    };

    let work_dir = args.work_dir.unwrap_or_else(|| std::env::temp_dir().join("runner-daemon"));
    let payload = Arc::new(PayloadStore::init(&work_dir).await?);

    let scheduler = RequestScheduler::new(
        Arc::new(SidecarIntrospector),
        Arc::new(HostAcceleratorProbe),
        payload.clone(),
        config,
    );

    let cancel = CancellationToken::new();
    let model_ref = args.model.to_string_lossy().into_owned();
    let opts = RuntimeOptions::default();

    let result = scheduler
        .run_completion(&model_ref, &opts, &args.prompt, &[], &cancel, |event| {
            print_event(event);
        })
        .await;

    scheduler.shutdown().await;
    payload.cleanup()?;
    result.context("completion request failed")
}

fn print_event(event: runner_core::stream_adapter::TokenEvent) {
    use runner_core::stream_adapter::TokenEvent;
    match event {
        TokenEvent::Content(text) => {
            print!("{text}");
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
        TokenEvent::Done { eval_count, eval_duration, .. } => {
            println!();
            tracing::info!(eval_count, ?eval_duration, "completion finished");
        }
    }
}
