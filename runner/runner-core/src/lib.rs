// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Inference runner supervisor and request scheduler core: spawns and
//! supervises the native runner process for a model, selects the best
//! available build for the host's accelerator, and serializes completion,
//! embedding, tokenize, and detokenize requests into it.
//!
//! A daemon embeds this crate rather than running it standalone: call
//! [`payload_store::PayloadStore::init`] and [`logging::init`] at
//! startup, construct a [`scheduler::RequestScheduler`] with concrete
//! [`model::ModelIntrospector`] and [`accel::AcceleratorProbe`]
//! implementations, and route HTTP requests to it.

pub mod accel;
pub mod config;
pub mod error;
pub mod grammar;
pub mod layer_planner;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod options;
pub mod payload_store;
pub mod runner_process;
pub mod scheduler;
pub mod stream_adapter;
pub mod variant;

pub use error::{Result, RunnerError};
