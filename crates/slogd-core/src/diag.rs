// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rate-limited self diagnostics and drop accounting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default emission cadence for hot-path diagnostics.
pub const DEFAULT_LOG_EVERY: u64 = 100;

/// Per-call-site limiter: lets the first occurrence through, then one of
/// every `every` occurrences.
#[derive(Debug)]
pub struct RateLimitedLog {
    every: u64,
    occurrences: AtomicU64,
}

impl Default for RateLimitedLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_EVERY)
    }
}

impl RateLimitedLog {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            occurrences: AtomicU64::new(0),
        }
    }

    /// Records one occurrence. Returns the running total when this
    /// occurrence should be logged.
    pub fn tick(&self) -> Option<u64> {
        let previous = self.occurrences.fetch_add(1, Ordering::Relaxed);
        if previous % self.every == 0 {
            Some(previous + 1)
        } else {
            None
        }
    }

    pub fn occurrences(&self) -> u64 {
        self.occurrences.load(Ordering::Relaxed)
    }
}

/// Why a unit of work was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Quota,
    Oversize,
    Unrouted,
    Io,
}

/// Counts of discarded units, readable while the daemon runs.
#[derive(Debug, Default)]
pub struct DropCounters {
    quota: AtomicU64,
    oversize: AtomicU64,
    unrouted: AtomicU64,
    io: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DropStats {
    pub quota: u64,
    pub oversize: u64,
    pub unrouted: u64,
    pub io: u64,
}

impl DropStats {
    pub fn total(&self) -> u64 {
        self.quota + self.oversize + self.unrouted + self.io
    }
}

impl DropCounters {
    pub fn record(&self, reason: DropReason) {
        self.record_many(reason, 1);
    }

    pub fn record_many(&self, reason: DropReason, count: u64) {
        if count == 0 {
            return;
        }
        let counter = match reason {
            DropReason::Quota => &self.quota,
            DropReason::Oversize => &self.oversize,
            DropReason::Unrouted => &self.unrouted,
            DropReason::Io => &self.io,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DropStats {
        DropStats {
            quota: self.quota.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            io: self.io.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_and_every_nth() {
        let limiter = RateLimitedLog::new(3);
        let emitted: Vec<Option<u64>> = (0..7).map(|_| limiter.tick()).collect();
        assert_eq!(
            emitted,
            vec![Some(1), None, None, Some(4), None, None, Some(7)]
        );
        assert_eq!(limiter.occurrences(), 7);
    }

    #[test]
    fn test_zero_cadence_logs_everything() {
        let limiter = RateLimitedLog::new(0);
        assert!(limiter.tick().is_some());
        assert!(limiter.tick().is_some());
    }

    #[test]
    fn test_drop_counters() {
        let counters = DropCounters::default();
        counters.record(DropReason::Quota);
        counters.record(DropReason::Quota);
        counters.record(DropReason::Unrouted);
        let stats = counters.snapshot();
        assert_eq!(stats.quota, 2);
        assert_eq!(stats.unrouted, 1);
        assert_eq!(stats.oversize, 0);
        assert_eq!(stats.total(), 3);
    }
}
