// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::group::FlushSummary;
use crate::store::LogStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Periodic worker draining every buffer into its files.
pub struct PeriodicFlusher {
    store: Arc<LogStore>,
    period: Duration,
    cancel: CancellationToken,
}

impl PeriodicFlusher {
    pub fn new(store: Arc<LogStore>, period: Duration, cancel: CancellationToken) -> Self {
        Self {
            store,
            period,
            cancel,
        }
    }

    /// Runs one pass on the blocking pool.
    pub async fn flush_once(&self) -> Option<FlushSummary> {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.periodic_flush(Instant::now())).await {
            Ok(summary) => {
                if summary.failed > 0 {
                    warn!(failed = summary.failed, "periodic flush left streams unflushed");
                } else if summary.flushed > 0 {
                    debug!(streams = summary.flushed, bytes = summary.bytes, "periodic flush");
                }
                Some(summary)
            }
            Err(e) => {
                error!("periodic flush task failed: {e}");
                None
            }
        }
    }

    /// Flushes every `period` until cancelled.
    pub async fn run(self) {
        debug!(period = ?self.period, "Periodic flusher started");
        let mut ticker = interval(self.period);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
            }
        }
        debug!("Periodic flusher stopped");
    }
}
