// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delay Strategies
//!
//! A delay strategy decides how long a failed message waits before it is
//! redelivered and which delay queue holds it meanwhile. Strategies are pure:
//! they see the origin queue, the attempt about to be made and the retry
//! budget, nothing else.

use std::fmt::Debug;

const DEFAULT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_BASE_MS: u64 = 1_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_MS: u64 = 1_000 * 60 * 30;
const DEFAULT_LEVELS: u32 = 5;

/// Where a retried message goes next and how long it waits there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayDecision {
    /// Numbered delay queue of the origin queue
    Step { step: u32, expiration_ms: u64 },
    /// Explicit routing key on the delay exchange
    RoutingKey {
        routing_key: String,
        expiration_ms: u64,
    },
    /// Explicit queue, addressed through the default exchange
    TargetQueue { queue: String, expiration_ms: u64 },
}

impl DelayDecision {
    pub fn expiration_ms(&self) -> u64 {
        match self {
            DelayDecision::Step { expiration_ms, .. }
            | DelayDecision::RoutingKey { expiration_ms, .. }
            | DelayDecision::TargetQueue { expiration_ms, .. } => *expiration_ms,
        }
    }
}

/// Decides the routing of a message about to be retried.
pub trait DelayStrategy: Send + Sync + Debug {
    /// `retry_count` is the attempt about to be scheduled, starting at 1.
    ///
    /// Returns `None` once `retry_count` exceeds `max_retries`; the caller must
    /// then park the message instead of retrying it.
    fn decide(&self, origin_queue: &str, retry_count: u32, max_retries: u32)
        -> Option<DelayDecision>;
}

fn clamp_step(retry_count: u32, levels: u32) -> u32 {
    retry_count.max(1).min(levels.max(1))
}

/// Waits the same amount of time before every retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedIntervalDelayStrategy {
    interval_ms: u64,
    levels: u32,
}

impl FixedIntervalDelayStrategy {
    /// Constant `interval_ms` over `levels` delay queues; 0 levels counts as 1.
    pub fn new(interval_ms: u64, levels: u32) -> Self {
        FixedIntervalDelayStrategy {
            interval_ms,
            levels,
        }
    }
}

impl Default for FixedIntervalDelayStrategy {
    fn default() -> Self {
        FixedIntervalDelayStrategy::new(DEFAULT_INTERVAL_MS, DEFAULT_LEVELS)
    }
}

impl DelayStrategy for FixedIntervalDelayStrategy {
    fn decide(
        &self,
        _origin_queue: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Option<DelayDecision> {
        if retry_count > max_retries {
            return None;
        }

        Some(DelayDecision::Step {
            step: clamp_step(retry_count, self.levels),
            expiration_ms: self.interval_ms,
        })
    }
}

/// Grows the delay geometrically up to a ceiling.
///
/// `levels` bounds how many numbered delay queues are used. Attempts past the
/// last level keep reusing its queue while the per-message expiration keeps
/// growing, so the spacing stays exponential with a bounded topology.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialDelayStrategy {
    base_ms: u64,
    multiplier: f64,
    max_ms: u64,
    levels: u32,
}

impl ExponentialDelayStrategy {
    /// Delay of `base_ms * multiplier^(n-1)` for attempt `n`, capped at `max_ms`.
    pub fn new(base_ms: u64, multiplier: f64, max_ms: u64, levels: u32) -> Self {
        ExponentialDelayStrategy {
            base_ms,
            multiplier,
            max_ms,
            levels,
        }
    }

    /// Expiration for a given attempt, before the step is picked.
    pub fn expiration_for(&self, retry_count: u32) -> u64 {
        let exponent = i32::try_from(retry_count.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = (self.base_ms as f64 * self.multiplier.powi(exponent)).round();

        if !raw.is_finite() || raw >= self.max_ms as f64 {
            self.max_ms
        } else {
            raw.max(0.0) as u64
        }
    }
}

impl Default for ExponentialDelayStrategy {
    fn default() -> Self {
        ExponentialDelayStrategy::new(
            DEFAULT_BASE_MS,
            DEFAULT_MULTIPLIER,
            DEFAULT_MAX_MS,
            DEFAULT_LEVELS,
        )
    }
}

impl DelayStrategy for ExponentialDelayStrategy {
    fn decide(
        &self,
        _origin_queue: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Option<DelayDecision> {
        if retry_count > max_retries {
            return None;
        }

        Some(DelayDecision::Step {
            step: clamp_step(retry_count, self.levels),
            expiration_ms: self.expiration_for(retry_count),
        })
    }
}
