// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Spawns one runner binary on an ephemeral port, watches for its exit,
//! waits for it to report healthy, and exposes the four request
//! operations plus `close`. The spawn-poll-kill-on-timeout shape is the
//! same one a one-shot CLI health check would use, generalized here into
//! an owned, queryable process handle.

use rand::Rng;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::model::ModelDescriptor;
use crate::options::RuntimeOptions;
use crate::{Result, RunnerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Starting,
    Ready,
    Closing,
    Closed,
    Failed,
    Crashed,
}

#[derive(Debug, Clone)]
pub enum ExitCause {
    Status(Option<i32>),
    WaitFailed(String),
}

impl std::fmt::Display for ExitCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCause::Status(Some(code)) => write!(f, "exited with status {code}"),
            ExitCause::Status(None) => write!(f, "exited (terminated by signal)"),
            ExitCause::WaitFailed(e) => write!(f, "failed to wait on child: {e}"),
        }
    }
}

const EPHEMERAL_PORT_LOW: u16 = 49152;
const EPHEMERAL_PORT_HIGH: u16 = 65535;

pub struct RunnerProcess {
    port: u16,
    variant: String,
    child: Arc<Mutex<Child>>,
    http: reqwest::Client,
    state: Arc<RwLock<RunnerState>>,
    exit_rx: watch::Receiver<Option<ExitCause>>,
    _watcher: tokio::task::JoinHandle<()>,
}

impl RunnerProcess {
    /// Picks a random ephemeral port, spawns `binary_path` with the
    /// runner's documented CLI argument list, and polls its health
    /// endpoint until ready or the configured timeout elapses.
    pub async fn spawn(
        model: &ModelDescriptor,
        opts: &RuntimeOptions,
        effective_num_ctx: u64,
        variant: &str,
        variant_dir: &Path,
        binary_path: &Path,
        config: &RunnerConfig,
    ) -> Result<Self> {
        let port = random_ephemeral_port();
        let args = build_args(model, opts, effective_num_ctx, port);

        let mut command = Command::new(binary_path);
        command.args(&args).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        prepend_loader_path(&mut command, variant_dir);

        tracing::info!(variant, port, binary = %binary_path.display(), "spawning runner");
        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("failed to exec {}: {e}", binary_path.display())))?;

        capture_log_stream(child.stdout.take(), variant, port, false);
        capture_log_stream(child.stderr.take(), variant, port, true);

        let (exit_tx, exit_rx) = watch::channel(None);
        let state = Arc::new(RwLock::new(RunnerState::Starting));
        let child = Arc::new(Mutex::new(child));
        let watcher = spawn_exit_watcher(child.clone(), exit_tx, state.clone());

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(RunnerError::Http)?;

        let mut this = Self { port, variant: variant.to_string(), child, http, state, exit_rx, _watcher: watcher };
        this.wait_until_healthy(config).await?;
        Ok(this)
    }

    async fn wait_until_healthy(&mut self, config: &RunnerConfig) -> Result<()> {
        let deadline = tokio::time::Instant::now() + config.health_timeout;
        let health_url = format!("http://127.0.0.1:{}/", self.port);

        loop {
            if let Some(cause) = self.exit_rx.borrow().clone() {
                *self.state.write().await = RunnerState::Failed;
                return Err(RunnerError::Spawn(format!("runner exited before becoming healthy: {cause}")));
            }

            if let Ok(resp) = self.http.head(&health_url).send().await {
                if resp.status().is_success() {
                    *self.state.write().await = RunnerState::Ready;
                    tracing::info!(port = self.port, variant = %self.variant, "runner healthy");
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.kill().await;
                *self.state.write().await = RunnerState::Failed;
                return Err(RunnerError::Spawn(format!(
                    "runner on port {} did not become healthy within {:?}",
                    self.port, config.health_timeout
                )));
            }

            tokio::time::sleep(config.health_poll_interval).await;
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub async fn state(&self) -> RunnerState {
        *self.state.read().await
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    async fn ensure_alive(&self) -> Result<()> {
        if let Some(cause) = self.exit_rx.borrow().clone() {
            return Err(RunnerError::RunnerCrashed(format!("{cause}; {}", crate::error::OOM_HINT)));
        }
        Ok(())
    }

    /// `POST /completion`; the raw HTTP response is handed to
    /// `StreamAdapter`, which owns the NDJSON parsing and retry policy.
    pub async fn completion_request(&self, body: serde_json::Value, cancel: &CancellationToken) -> Result<reqwest::Response> {
        self.ensure_alive().await?;
        let req = self.http.post(format!("{}/completion", self.base_url())).json(&body).send();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
            res = req => res.map_err(RunnerError::Http),
        }
    }

    pub async fn embedding(&self, content: &str, cancel: &CancellationToken) -> Result<Vec<f64>> {
        self.ensure_alive().await?;
        #[derive(serde::Deserialize)]
        struct EmbeddingResp {
            embedding: Vec<f64>,
        }
        let req = self.http.post(format!("{}/embedding", self.base_url())).json(&json!({ "content": content })).send();
        let resp = select_or_cancel(req, cancel).await?;
        let resp = error_for_status(resp).await?;
        let parsed: EmbeddingResp = resp.json().await.map_err(RunnerError::Http)?;
        Ok(parsed.embedding)
    }

    pub async fn tokenize(&self, content: &str, cancel: &CancellationToken) -> Result<Vec<i64>> {
        self.ensure_alive().await?;
        #[derive(serde::Deserialize)]
        struct TokenizeResp {
            tokens: Vec<i64>,
        }
        let req = self.http.post(format!("{}/tokenize", self.base_url())).json(&json!({ "content": content })).send();
        let resp = select_or_cancel(req, cancel).await?;
        let resp = error_for_status(resp).await?;
        let parsed: TokenizeResp = resp.json().await.map_err(RunnerError::Http)?;
        Ok(parsed.tokens)
    }

    pub async fn detokenize(&self, tokens: &[i64], cancel: &CancellationToken) -> Result<String> {
        self.ensure_alive().await?;
        #[derive(serde::Deserialize)]
        struct DetokenizeResp {
            content: String,
        }
        let req = self.http.post(format!("{}/detokenize", self.base_url())).json(&json!({ "tokens": tokens })).send();
        let resp = select_or_cancel(req, cancel).await?;
        let resp = error_for_status(resp).await?;
        let parsed: DetokenizeResp = resp.json().await.map_err(RunnerError::Http)?;
        Ok(parsed.content)
    }

    async fn kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }

    /// Signals the child process and waits for it to exit. No further
    /// requests may be submitted once this returns.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == RunnerState::Closed {
                return Ok(());
            }
            *state = RunnerState::Closing;
        }
        self.kill().await;
        if self.exit_rx.borrow().is_none() {
            let mut rx = self.exit_rx.clone();
            let _ = rx.changed().await;
        }
        *self.state.write().await = RunnerState::Closed;
        Ok(())
    }
}

async fn select_or_cancel(
    fut: impl std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunnerError::Cancelled),
        res = fut => res.map_err(RunnerError::Http),
    }
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_client_error() || resp.status().is_server_error() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(RunnerError::TransportHttp { status, body });
    }
    Ok(resp)
}

fn random_ephemeral_port() -> u16 {
    rand::thread_rng().gen_range(EPHEMERAL_PORT_LOW..EPHEMERAL_PORT_HIGH)
}

/// Prepends `variant_dir` to the dynamic-linker search path so the
/// runner's shared libraries resolve without a system-wide install.
fn prepend_loader_path(command: &mut Command, variant_dir: &Path) {
    let var = if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(target_os = "windows") {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    };
    let existing = std::env::var_os(var).unwrap_or_default();
    let mut joined = variant_dir.as_os_str().to_os_string();
    if !existing.is_empty() {
        joined.push(if cfg!(target_os = "windows") { ";" } else { ":" });
        joined.push(&existing);
    }
    command.env(var, joined);
}

fn spawn_exit_watcher(
    child: Arc<Mutex<Child>>,
    exit_tx: watch::Sender<Option<ExitCause>>,
    state: Arc<RwLock<RunnerState>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut guard = child.lock().await;
            match guard.try_wait() {
                Ok(Some(status)) => {
                    drop(guard);
                    let was_ready = *state.read().await == RunnerState::Ready;
                    if was_ready {
                        *state.write().await = RunnerState::Crashed;
                    }
                    let _ = exit_tx.send(Some(ExitCause::Status(status.code())));
                    return;
                }
                Ok(None) => {
                    drop(guard);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => {
                    drop(guard);
                    let _ = exit_tx.send(Some(ExitCause::WaitFailed(e.to_string())));
                    return;
                }
            }
        }
    })
}

fn capture_log_stream<R>(pipe: Option<R>, variant: &str, port: u16, is_stderr: bool)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else { return };
    let variant = variant.to_string();
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                tracing::debug!(variant = %variant, port, stream = "stderr", "{line}");
            } else {
                tracing::debug!(variant = %variant, port, stream = "stdout", "{line}");
            }
        }
    });
}

/// Builds the runner's CLI argument list. `serde_json` never
/// HTML-escapes its output (unlike some other ecosystems' JSON
/// encoders), so prompts containing `<`, `>`, `&` round-trip verbatim
/// through the `/completion` body without extra configuration.
fn build_args(model: &ModelDescriptor, opts: &RuntimeOptions, effective_num_ctx: u64, port: u16) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        model.file_path.to_string_lossy().into_owned(),
        "--ctx-size".to_string(),
        effective_num_ctx.to_string(),
        "--batch-size".to_string(),
        opts.num_batch.to_string(),
        "--embedding".to_string(),
        "--log-disable".to_string(),
        "--port".to_string(),
        port.to_string(),
    ];

    if opts.num_gpu != 0 {
        args.push("--n-gpu-layers".to_string());
        args.push(opts.num_gpu.to_string());
    }
    if opts.main_gpu != 0 {
        args.push("--main-gpu".to_string());
        args.push(opts.main_gpu.to_string());
    }
    if let Some(base) = opts.rope_freq_base {
        args.push("--rope-freq-base".to_string());
        args.push(base.to_string());
    }
    if let Some(scale) = opts.rope_freq_scale {
        args.push("--rope-freq-scale".to_string());
        args.push(scale.to_string());
    }
    if let Some(lora) = opts.lora_adapters.first() {
        args.push("--lora".to_string());
        args.push(lora.to_string_lossy().into_owned());
    }
    if let Some(mmproj) = opts.vision_projectors.first() {
        args.push("--mmproj".to_string());
        args.push(mmproj.to_string_lossy().into_owned());
    }
    if opts.num_thread > 0 {
        args.push("--threads".to_string());
        args.push(opts.num_thread.to_string());
    }
    if !opts.f16_kv {
        args.push("--memory-f32".to_string());
    }
    if opts.use_mlock {
        args.push("--mlock".to_string());
    }
    if !opts.use_mmap {
        args.push("--no-mmap".to_string());
    }
    if opts.use_numa {
        args.push("--numa".to_string());
    }
    if std::env::var_os("OLLAMA_DEBUG").is_some() {
        args.push("--verbose".to_string());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn model() -> ModelDescriptor {
        ModelDescriptor {
            file_path: PathBuf::from("/models/test.gguf"),
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

    #[test]
    fn builds_core_args() {
        let opts = RuntimeOptions::default();
        let args = build_args(&model(), &opts, 2048, 54321);
        assert!(args.windows(2).any(|w| w == ["--model", "/models/test.gguf"]));
        assert!(args.windows(2).any(|w| w == ["--ctx-size", "2048"]));
        assert!(args.windows(2).any(|w| w == ["--port", "54321"]));
        assert!(args.contains(&"--embedding".to_string()));
        assert!(args.contains(&"--log-disable".to_string()));
    }

    #[test]
    fn omits_optional_flags_when_unset() {
        let opts = RuntimeOptions::default();
        let args = build_args(&model(), &opts, 2048, 54321);
        assert!(!args.contains(&"--mlock".to_string()));
        assert!(!args.contains(&"--no-mmap".to_string()));
        assert!(!args.contains(&"--numa".to_string()));
        assert!(!args.contains(&"--memory-f32".to_string()));
    }

    #[test]
    fn includes_f32_flag_when_f16_kv_disabled() {
        let mut opts = RuntimeOptions::default();
        opts.f16_kv = false;
        let args = build_args(&model(), &opts, 2048, 54321);
        assert!(args.contains(&"--memory-f32".to_string()));
    }

    #[test]
    fn random_port_is_in_ephemeral_range() {
        for _ in 0..100 {
            let port = random_ephemeral_port();
            assert!(port >= EPHEMERAL_PORT_LOW && port < EPHEMERAL_PORT_HIGH);
        }
    }
}
