// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

use thiserror::Error;

/// Everything that can go wrong while selecting, spawning, or talking to a
/// runner. Only [`RunnerError::SlotBusyExhausted`]'s underlying signal
/// ("slot unavailable") is ever handled locally (retried); every other
/// variant is surfaced to the caller.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Part of the documented error taxonomy (spec'd as a caller-retryable
    /// capacity failure), but `LayerPlanner` never constructs it today — an
    /// infeasible fit falls back to CPU rather than failing the request.
    /// Kept as a variant for a future planner policy that refuses instead
    /// of falling back, and for callers that want to match on it.
    #[error("estimated footprint exceeds available memory: {0}")]
    Capacity(String),

    #[error("no compatible runner variant for this accelerator")]
    NoBackend,

    #[error("failed to start runner: {0}")]
    Spawn(String),

    #[error("runner returned {status}: {body}")]
    TransportHttp { status: u16, body: String },

    #[error("malformed stream line: {0}")]
    StreamMalformed(String),

    #[error("runner exited mid-request: {0}")]
    RunnerCrashed(String),

    #[error("slot-busy retry budget exceeded")]
    SlotBusyExhausted,

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Hint appended to [`RunnerError::RunnerCrashed`] when the transport saw an
/// unexpected EOF instead of a clean `stop:true` terminal event.
pub const OOM_HINT: &str =
    "runner exited unexpectedly while generating a response, this is likely out of memory";
