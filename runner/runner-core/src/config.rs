// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Operator-tunable knobs. [`RunnerConfig::default`] reproduces the
//! historical constants (200ms health poll, 3 minute health timeout, 3
//! slot-busy retries, 100us backoff seed) exactly, so a daemon that never
//! ships a config file behaves the same as before this was made
//! configurable. Parsing the config file itself (and any CLI/env layering
//! on top of it) remains the outer daemon's job — this crate only defines
//! the shape and its defaults.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Root directory under which `PayloadStore` extracts per-variant
    /// runner binaries. Defaults to a process-scoped temp directory.
    pub work_dir: PathBuf,

    /// Interval between health-check polls while a runner is starting.
    #[serde(with = "duration_ms")]
    pub health_poll_interval: Duration,

    /// End-to-end budget for a runner to become healthy before it is
    /// killed and reported as a spawn failure.
    #[serde(with = "duration_secs")]
    pub health_timeout: Duration,

    /// Maximum number of slot-busy retry attempts per completion request.
    pub slot_busy_max_attempts: u32,

    /// Seed for the slot-busy exponential backoff: `seed * 2^(attempt-1)`.
    #[serde(with = "duration_micros")]
    pub slot_busy_backoff_seed: Duration,

    /// How long a `RunnerProcess` may sit idle before `RequestScheduler`
    /// closes it.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Minimum line-buffer capacity for the completion event scanner.
    pub stream_buffer_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("inference-runner"),
            health_poll_interval: Duration::from_millis(200),
            health_timeout: Duration::from_secs(180),
            slot_busy_max_attempts: 3,
            slot_busy_backoff_seed: Duration::from_micros(100),
            idle_timeout: Duration::from_secs(5 * 60),
            stream_buffer_bytes: 512 * 1024,
        }
    }
}

impl RunnerConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_micros() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_historical_constants() {
        let cfg = RunnerConfig::default();
        assert_eq!(cfg.health_poll_interval, Duration::from_millis(200));
        assert_eq!(cfg.health_timeout, Duration::from_secs(180));
        assert_eq!(cfg.slot_busy_max_attempts, 3);
        assert_eq!(cfg.slot_busy_backoff_seed, Duration::from_micros(100));
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = RunnerConfig::default();
        let s = toml::to_string(&cfg).unwrap();
        let back = RunnerConfig::from_toml_str(&s).unwrap();
        assert_eq!(cfg.health_timeout, back.health_timeout);
    }
}
