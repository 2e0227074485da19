/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for stream reconnects:
/// `min(max, base * multiplier^attempt) * (1 + jitter)`, jitter drawn
/// uniformly from `[-j, +j]`. The attempt counter resets once a connection
/// proves stable.
#[derive(Debug)]
pub(crate) struct Backoff {
    base_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(config: &ReconnectConfig) -> Self {
        Backoff {
            base_ms: config.base_delay_ms as f64,
            max_ms: config.max_delay_ms as f64,
            multiplier: config.multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay to wait before the next connection attempt; bumps the
    /// attempt counter.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self.multiplier.powi(self.attempt.min(64) as i32);
        let capped = (self.base_ms * exp).min(self.max_ms);
        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((capped * factor).round().max(0.0) as u64)
    }
}
