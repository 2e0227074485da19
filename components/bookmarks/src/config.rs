/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

fn default_timeout_ms() -> u64 {
    5000
}

/// Everything the kernel needs to know at construction time. All tuning
/// knobs have defaults; only the namespace and service base URL are
/// required, so a partial JSON config deserializes fine.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    /// The tree this kernel instance synchronizes.
    pub namespace: String,

    /// Base URL of the remote service.
    #[serde(rename = "baseURL")]
    pub base_url: Url,

    /// Timeout for each outbound mutation call, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Where the operation log and materialized tree are persisted.
    /// `None` keeps everything in memory (tests, private sessions).
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub reachability: ReachabilityConfig,
}

impl KernelConfig {
    pub fn new(namespace: impl Into<String>, base_url: Url) -> Self {
        KernelConfig {
            namespace: namespace.into(),
            base_url,
            timeout_ms: default_timeout_ms(),
            db_path: None,
            reconnect: ReconnectConfig::default(),
            sync: SyncConfig::default(),
            reachability: ReachabilityConfig::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Tuning for the inbound event stream's reconnect behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Relative jitter applied to each delay, in `[-jitter, +jitter]`.
    pub jitter: f64,
    /// How long a connection must stay up before it counts as stable and
    /// the backoff counter resets.
    pub stable_threshold_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.3,
            stable_threshold_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn stable_threshold(&self) -> Duration {
        Duration::from_millis(self.stable_threshold_ms)
    }
}

/// Tuning for the outbound sync scheduler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long after the first dispatch a batch waits before shipping.
    pub batch_window_ms: u64,
    /// Delay before the nth retry of a failed operation; the last entry
    /// repeats.
    pub retry_delays_ms: Vec<u64>,
    /// Operations past this many retries wait for an explicit force or a
    /// connectivity change.
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            batch_window_ms: 100,
            retry_delays_ms: vec![1000, 2000, 5000, 10_000, 30_000],
            max_retries: 5,
        }
    }
}

impl SyncConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Delay to wait after an operation's `retry_count`th failure.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let delays = &self.retry_delays_ms;
        let ms = match delays.len() {
            0 => 1000,
            n => delays[(retry_count.saturating_sub(1) as usize).min(n - 1)],
        };
        Duration::from_millis(ms)
    }
}

/// Tuning for the periodic reachability probe.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        ReachabilityConfig {
            interval_ms: 10_000,
            timeout_ms: 5000,
        }
    }
}

impl ReachabilityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
