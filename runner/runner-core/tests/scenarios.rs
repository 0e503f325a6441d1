// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! End-to-end exercises of the slot-busy retry, crash-on-EOF, and JSON
//! grammar injection behaviors against `fake-runner-fixture`, a real
//! process speaking the runner's wire protocol on loopback HTTP. Spawns
//! a real binary and drives it over HTTP rather than mocking the
//! transport.

use runner_core::config::RunnerConfig;
use runner_core::model::ModelDescriptor;
use runner_core::options::{OutputFormat, RuntimeOptions};
use runner_core::runner_process::RunnerProcess;
use runner_core::stream_adapter::{StreamAdapter, TokenEvent};
use runner_core::RunnerError;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

fn fixture_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fake-runner-fixture"))
}

fn model(script: &str) -> ModelDescriptor {
    ModelDescriptor {
        file_path: format!("test-model-{script}.gguf").into(),
        file_size: 0,
        layer_count: 1,
        embedding_dim: 1,
        head_count: 1,
        kv_head_count: 1,
        max_context: 4096,
        vision_projector: None,
        lora_adapter: None,
    }
}

async fn spawn_fixture(script: &str) -> RunnerProcess {
    let binary = fixture_binary();
    let variant_dir = binary.parent().unwrap().to_path_buf();
    let config = RunnerConfig::default();
    RunnerProcess::spawn(&model(script), &RuntimeOptions::default(), 4096, "cpu", &variant_dir, &binary, &config)
        .await
        .expect("fixture runner should become healthy")
}

#[tokio::test]
async fn slot_busy_then_success() {
    let runner = spawn_fixture("slot_busy_once").await;
    let adapter = StreamAdapter::new(&runner, &RunnerConfig::default());
    let cancel = CancellationToken::new();

    let mut content_events = 0;
    let mut saw_done = false;
    adapter
        .run_completion(serde_json::json!({"prompt": "hi", "stream": true}), &cancel, |event| match event {
            TokenEvent::Content(_) => content_events += 1,
            TokenEvent::Done { .. } => saw_done = true,
        })
        .await
        .expect("retried request should succeed");

    assert_eq!(content_events, 3);
    assert!(saw_done);
    runner.close().await.unwrap();
}

#[tokio::test]
async fn crash_on_eof_reports_runner_crashed_with_oom_hint() {
    let runner = spawn_fixture("crash_eof").await;
    let adapter = StreamAdapter::new(&runner, &RunnerConfig::default());
    let cancel = CancellationToken::new();

    let err = adapter
        .run_completion(serde_json::json!({"prompt": "hi", "stream": true}), &cancel, |_| {})
        .await
        .unwrap_err();

    match err {
        RunnerError::RunnerCrashed(msg) => assert!(msg.contains("out of memory") || msg.contains("insufficient")),
        other => panic!("expected RunnerCrashed, got {other:?}"),
    }
    runner.close().await.unwrap();
}

#[tokio::test]
async fn json_format_injects_grammar_and_nothing_else_changes() {
    let runner = spawn_fixture("echo_grammar").await;
    let adapter = StreamAdapter::new(&runner, &RunnerConfig::default());
    let cancel = CancellationToken::new();

    let mut opts = RuntimeOptions::default();
    opts.format = OutputFormat::Json;
    let mut body = serde_json::json!({"prompt": "hi", "stream": true});
    if opts.format == OutputFormat::Json {
        body["grammar"] = serde_json::Value::String(runner_core::grammar::JSON_GRAMMAR.to_string());
    }
    assert_eq!(body["prompt"], "hi");
    assert!(body.get("grammar").is_some());

    let mut observed = String::new();
    adapter
        .run_completion(body, &cancel, |event| {
            if let TokenEvent::Content(text) = event {
                observed.push_str(&text);
            }
        })
        .await
        .unwrap();

    assert_eq!(observed, "grammar_present=true");
    runner.close().await.unwrap();
}
