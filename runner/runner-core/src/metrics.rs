// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Prometheus metrics for the scheduler and runner lifecycle, registered
//! via the usual `lazy_static!` + `register_*!` pattern.

use lazy_static::lazy_static;
use prometheus::{histogram_opts, opts, register_counter, register_gauge, register_histogram, register_int_counter};
use prometheus::{Counter, Gauge, Histogram, IntCounter};

lazy_static! {
    pub static ref RUNNER_SPAWNS: Counter =
        register_counter!(opts!("runner_spawns_total", "Number of runner spawn attempts.")).unwrap();
    pub static ref RUNNER_SPAWN_FAILURES: Counter =
        register_counter!(opts!("runner_spawn_failures_total", "Number of runner spawns that never became healthy.")).unwrap();
    pub static ref RUNNER_SPAWN_DURATION: Histogram = register_histogram!(histogram_opts!(
        "runner_spawn_duration_seconds",
        "Time from process exec to the first healthy response.",
        vec![0.05, 0.1, 0.5, 1., 5., 15., 30., 60., 120., 180.],
    ))
    .unwrap();
    pub static ref ACTIVE_RUNNERS: Gauge =
        register_gauge!(opts!("runner_active", "Number of currently live runner processes.")).unwrap();
    pub static ref RUNNER_CRASHES: Counter =
        register_counter!(opts!("runner_crashes_total", "Number of runners that exited mid-request.")).unwrap();
    pub static ref COMPLETION_REQUESTS: IntCounter =
        register_int_counter!("completion_requests_total", "Number of completion requests accepted by the scheduler.").unwrap();
    pub static ref SLOT_BUSY_RETRIES: IntCounter =
        register_int_counter!("slot_busy_retries_total", "Number of slot-busy retries performed by the stream adapter.").unwrap();
    pub static ref SCHEDULER_QUEUE_WAIT: Histogram = register_histogram!(histogram_opts!(
        "scheduler_queue_wait_seconds",
        "Time a request waited in a runner's FIFO queue before being served.",
        vec![0.001, 0.01, 0.1, 0.5, 1., 5., 15., 60.],
    ))
    .unwrap();
}
