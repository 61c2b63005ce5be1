// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-windowed byte budget applied before data reaches disk.
//!
//! A category's daily budget is split into fixed windows so a burst can only
//! spend one window's share. Denied data is dropped by the caller, never
//! queued.

use crate::category::LogCategory;
use crate::error::LogError;
use derive_more::Display;
use hashbrown::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Identifies who is spending the budget: a category plus the stream name.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
#[display("{category}/{stream}")]
pub struct QuotaLabel {
    pub category: LogCategory,
    pub stream: String,
}

impl QuotaLabel {
    pub fn new(category: LogCategory, stream: impl Into<String>) -> Self {
        Self {
            category,
            stream: stream.into(),
        }
    }
}

/// Daily byte budgets per category, shared by every stream of a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub budgets: [u64; 4],
    pub window: Duration,
}

impl QuotaPolicy {
    /// Quota for one stream, or `None` when its category has no budget.
    pub fn for_stream(
        &self,
        category: LogCategory,
        footprint: u64,
    ) -> Result<Option<ByteQuota>, LogError> {
        match self.budgets[category.index()] {
            0 => Ok(None),
            budget => ByteQuota::init(category, budget, footprint, self.window).map(Some),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    consumed: u64,
}

#[derive(Debug)]
pub struct ByteQuota {
    category: LogCategory,
    window: Duration,
    window_budget: u64,
    windows: HashMap<String, Window>,
}

impl ByteQuota {
    /// Derives the per-window budget from a daily budget.
    ///
    /// The division floors, so rounding never lets the day's total through.
    /// A non-zero `footprint` (the stream's on-disk bound) caps the result.
    pub fn init(
        category: LogCategory,
        daily_budget: u64,
        footprint: u64,
        window: Duration,
    ) -> Result<Self, LogError> {
        if window.is_zero() || window > DAY {
            return Err(LogError::InputInvalid(format!(
                "quota window for {category} must be within (0, 1 day], got {window:?}"
            )));
        }
        let share = u128::from(daily_budget) * window.as_millis() / DAY.as_millis();
        let mut window_budget = u64::try_from(share).unwrap_or(u64::MAX);
        if footprint != 0 {
            window_budget = window_budget.min(footprint);
        }
        debug!(
            %category,
            daily_budget, window_budget, "write quota initialized"
        );
        Ok(Self::with_window_budget(category, window_budget, window))
    }

    pub fn with_window_budget(category: LogCategory, window_budget: u64, window: Duration) -> Self {
        Self {
            category,
            window,
            window_budget,
            windows: HashMap::new(),
        }
    }

    pub fn category(&self) -> LogCategory {
        self.category
    }

    pub fn window_budget(&self) -> u64 {
        self.window_budget
    }

    pub fn check(&mut self, len: usize, label: &QuotaLabel) -> bool {
        self.check_at(len, label, Instant::now())
    }

    /// Returns true and charges `len` bytes when they fit the current
    /// window. A denial leaves the window untouched.
    pub fn check_at(&mut self, len: usize, label: &QuotaLabel, now: Instant) -> bool {
        if label.stream.is_empty() {
            return false;
        }
        let len = len as u64;
        let period = self.window;
        let window = self.windows.entry(label.stream.clone()).or_insert(Window {
            started: now,
            consumed: 0,
        });
        if now.saturating_duration_since(window.started) >= period {
            window.started = now;
            window.consumed = 0;
        }
        if len >= self.window_budget {
            return false;
        }
        match window.consumed.checked_add(len) {
            Some(total) if total <= self.window_budget => {
                window.consumed = total;
                true
            }
            _ => false,
        }
    }

    /// Bytes charged to `label` in its current window.
    pub fn consumed(&self, label: &QuotaLabel) -> u64 {
        self.windows
            .get(label.stream.as_str())
            .map_or(0, |window| window.consumed)
    }
}
