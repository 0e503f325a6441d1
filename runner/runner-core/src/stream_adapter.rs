// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Translates the runner's newline-delimited `data: {…}\n` event stream
//! into caller-visible [`TokenEvent`]s, handling the slot-busy retry and
//! cancellation contracts. The message loop reads, matches on message
//! shape, and maps transport errors into the crate's own error type,
//! the same way a WebSocket frame loop would, generalized here to an
//! HTTP NDJSON body.

use futures_util::TryStreamExt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::runner_process::RunnerProcess;
use crate::{Result, RunnerError};

/// Substring the runner emits as the first line of a response when its
/// single generation slot is occupied.
const SLOT_BUSY_SIGNAL: &str = "slot unavailable";

#[derive(Debug, Clone)]
pub enum TokenEvent {
    Content(String),
    Done {
        prompt_eval_count: u64,
        prompt_eval_duration: Duration,
        eval_count: u64,
        eval_duration: Duration,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Timings {
    #[serde(default)]
    predicted_n: u64,
    #[serde(default)]
    predicted_ms: f64,
    #[serde(default)]
    prompt_n: u64,
    #[serde(default)]
    prompt_ms: f64,
}

#[derive(Debug, serde::Deserialize)]
struct RunnerEvent {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    timings: Option<Timings>,
}

pub struct StreamAdapter<'a> {
    runner: &'a RunnerProcess,
    config: &'a RunnerConfig,
}

impl<'a> StreamAdapter<'a> {
    pub fn new(runner: &'a RunnerProcess, config: &'a RunnerConfig) -> Self {
        Self { runner, config }
    }

    /// Drives one completion request end to end, invoking `on_event` for
    /// every token and exactly once for the terminal `done` event. On the
    /// slot-busy signal the whole request (not just the stream read) is
    /// retried with exponential backoff up to
    /// `config.slot_busy_max_attempts`.
    pub async fn run_completion(
        &self,
        body: serde_json::Value,
        cancel: &CancellationToken,
        mut on_event: impl FnMut(TokenEvent),
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_once(&body, cancel, &mut on_event).await {
                Ok(()) => return Ok(()),
                Err(RetryOutcome::SlotBusy) => {
                    if attempt >= self.config.slot_busy_max_attempts {
                        return Err(RunnerError::SlotBusyExhausted);
                    }
                    crate::metrics::SLOT_BUSY_RETRIES.inc();
                    let backoff = self.config.slot_busy_backoff_seed * 2u32.pow(attempt - 1);
                    tracing::debug!(attempt, ?backoff, "runner slot busy, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(RetryOutcome::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Returns `Ok(())` on a clean terminal event, `Err(SlotBusy)` when the
    /// whole request should be retried, or `Err(Fatal)` for anything else.
    async fn try_once(
        &self,
        body: &serde_json::Value,
        cancel: &CancellationToken,
        on_event: &mut impl FnMut(TokenEvent),
    ) -> std::result::Result<(), RetryOutcome> {
        let resp = self.runner.completion_request(body.clone(), cancel).await.map_err(RetryOutcome::Fatal)?;
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(RetryOutcome::Fatal(RunnerError::TransportHttp { status: status.as_u16(), body: body_text }));
        }

        let byte_stream = resp.bytes_stream().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let reader = tokio_util::io::StreamReader::new(byte_stream);
        let mut lines = BufReader::with_capacity(self.config.stream_buffer_bytes, reader).lines();

        let mut saw_stop = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryOutcome::Fatal(RunnerError::Cancelled)),
                next = lines.next_line() => next,
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    return Err(RetryOutcome::Fatal(RunnerError::RunnerCrashed(format!(
                        "transport error reading stream: {e}; {}",
                        crate::error::OOM_HINT
                    ))));
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.contains(SLOT_BUSY_SIGNAL) {
                return Err(RetryOutcome::SlotBusy);
            }
            let Some(payload) = trimmed.strip_prefix("data: ") else {
                return Err(RetryOutcome::Fatal(RunnerError::StreamMalformed(line.clone())));
            };

            let event: RunnerEvent = serde_json::from_str(payload)
                .map_err(|e| RetryOutcome::Fatal(RunnerError::StreamMalformed(format!("{e}: {payload}"))))?;

            if !event.content.is_empty() {
                on_event(TokenEvent::Content(event.content));
            }
            if event.stop {
                let t = event.timings.unwrap_or(Timings { predicted_n: 0, predicted_ms: 0.0, prompt_n: 0, prompt_ms: 0.0 });
                on_event(TokenEvent::Done {
                    prompt_eval_count: t.prompt_n,
                    prompt_eval_duration: Duration::from_secs_f64(t.prompt_ms / 1000.0),
                    eval_count: t.predicted_n,
                    eval_duration: Duration::from_secs_f64(t.predicted_ms / 1000.0),
                });
                saw_stop = true;
                break;
            }
        }

        if saw_stop {
            Ok(())
        } else {
            Err(RetryOutcome::Fatal(RunnerError::RunnerCrashed(format!(
                "stream ended without a stop event; {}",
                crate::error::OOM_HINT
            ))))
        }
    }
}

enum RetryOutcome {
    SlotBusy,
    Fatal(RunnerError),
}
