// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Stands in for the native runner binary in `runner-core`'s integration
//! tests. Accepts the same CLI surface `runner_process::build_args`
//! emits so it can be spawned exactly like the real thing, and answers
//! `/completion` according to `FAKE_RUNNER_SCRIPT`:
//!
//! - `ok`: three content events then `stop:true`.
//! - `slot_busy_once`: slot-busy on the first call, `ok` behavior after.
//! - `crash_eof`: one content event, stream ends with no `stop`.
//! - `echo_grammar`: one content event reporting whether `grammar` was
//!   present in the request body, then `stop:true`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(allow_negative_numbers = true)]
struct Args {
    #[clap(long)]
    model: String,
    #[clap(long = "ctx-size")]
    ctx_size: u64,
    #[clap(long = "batch-size")]
    batch_size: u32,
    #[clap(long)]
    embedding: bool,
    #[clap(long = "log-disable")]
    log_disable: bool,
    #[clap(long = "n-gpu-layers")]
    n_gpu_layers: Option<i32>,
    #[clap(long = "main-gpu")]
    main_gpu: Option<u32>,
    #[clap(long = "rope-freq-base")]
    rope_freq_base: Option<f32>,
    #[clap(long = "rope-freq-scale")]
    rope_freq_scale: Option<f32>,
    #[clap(long)]
    lora: Option<String>,
    #[clap(long)]
    mmproj: Option<String>,
    #[clap(long)]
    threads: Option<u32>,
    #[clap(long = "memory-f32")]
    memory_f32: bool,
    #[clap(long)]
    mlock: bool,
    #[clap(long = "no-mmap")]
    no_mmap: bool,
    #[clap(long)]
    numa: bool,
    #[clap(long)]
    port: u16,
    #[clap(long)]
    verbose: bool,
}

struct AppState {
    script: String,
    call_count: AtomicU32,
}

/// Tests select fixture behavior by embedding a script name in the
/// `--model` path (e.g. `test-model-crash_eof.gguf`) rather than through
/// process environment, since env vars would race across the parallel
/// `#[tokio::test]` processes that spawn this binary concurrently.
fn script_from_model_path(model: &str) -> String {
    for candidate in ["slot_busy_once", "crash_eof", "echo_grammar", "ok"] {
        if model.contains(candidate) {
            return candidate.to_string();
        }
    }
    "ok".to_string()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let script = script_from_model_path(&args.model);
    let state = Arc::new(AppState { script, call_count: AtomicU32::new(0) });

    let app = Router::new()
        .route("/", get(|| async { StatusCode::OK }))
        .route("/completion", post(completion))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port)).await.expect("bind");
    axum::serve(listener, app).await.expect("serve");
}

async fn completion(State(state): State<Arc<AppState>>, Json(body): Json<serde_json::Value>) -> String {
    let call = state.call_count.fetch_add(1, Ordering::SeqCst);

    match state.script.as_str() {
        "slot_busy_once" if call == 0 => "data: {\"slot unavailable\": true}\n".to_string(),
        "crash_eof" => ndjson_content("partial"),
        "echo_grammar" => {
            let saw_grammar = body.get("grammar").is_some();
            ndjson_stream(&[&format!("grammar_present={saw_grammar}")])
        }
        _ => ndjson_stream(&["one", "two", "three"]),
    }
}

fn ndjson_content(content: &str) -> String {
    format!("data: {}\n", serde_json::json!({"content": content, "stop": false}))
}

fn ndjson_stream(contents: &[&str]) -> String {
    let mut out = String::new();
    for c in contents {
        out.push_str(&format!("data: {}\n", serde_json::json!({"content": c, "stop": false})));
    }
    out.push_str(&format!(
        "data: {}\n",
        serde_json::json!({
            "content": "",
            "stop": true,
            "timings": {"predicted_n": contents.len(), "predicted_ms": 5.0, "prompt_n": 1, "prompt_ms": 1.0},
        })
    ));
    out
}
