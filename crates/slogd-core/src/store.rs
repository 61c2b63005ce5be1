// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point of the persistence path.
//!
//! `LogStore` owns one host stream per category, the per-application
//! streams created on demand, and the group registry. Records are routed to
//! exactly one of them.

use crate::category::LogCategory;
use crate::compress::GzipCompressor;
use crate::config::{SlogdConfig, StreamConfig};
use crate::diag::{DropStats, RateLimitedLog};
use crate::error::LogError;
use crate::file_set::AppendOutcome;
use crate::group::{FlushSummary, GroupRegistry};
use crate::level::LevelTable;
use crate::naming::{ACTIVE_COMPRESSED_SUFFIX, COMPRESSED_SUFFIX, PLAIN_SUFFIX};
use crate::record::LogRecord;
use crate::ring_buffer::AccessMode;
use crate::stream::{LogStream, StreamFactory};
use hashbrown::HashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Stream directory of host-level records in every category.
pub const SYSTEM_STREAM: &str = "device-os";
/// Directory prefix of per-application streams.
pub const APP_STREAM_PREFIX: &str = "device-app-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    All,
    /// Only the streams of one application process.
    App(u32),
}

/// Where the daemon keeps its files, for collectors outside the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPatterns {
    pub root: PathBuf,
    pub group_root: PathBuf,
    pub group_names: Vec<String>,
    pub suffixes: Vec<String>,
}

/// Point-in-time view of the store, served to collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub drops: DropStats,
    pub groups: usize,
    /// Application streams currently held; idle ones are released.
    pub app_streams: usize,
    /// Bytes staged in every buffer and not yet on disk.
    pub pending_bytes: usize,
}

type AppKey = (u32, LogCategory);

#[derive(Debug)]
struct AppEntry {
    stream: Arc<LogStream>,
    /// First periodic pass that found the stream unwritten.
    idle_since: Option<Instant>,
}

/// Routes records to their streams and drives the flush cycle.
///
/// Application streams are created on first use and released once they have
/// been idle for `idle_after`, so pids that come and go do not accumulate.
#[derive(Debug)]
pub struct LogStore {
    root: PathBuf,
    factory: StreamFactory,
    system: Vec<LogStream>,
    app_sizing: StreamConfig,
    apps: Mutex<HashMap<AppKey, AppEntry>>,
    /// At least one quota window, so releasing a stream never hands it a
    /// fresh budget early.
    idle_after: Duration,
    registry: GroupRegistry,
    levels: LevelTable,
    flush_errors: RateLimitedLog,
    app_errors: RateLimitedLog,
}

impl LogStore {
    /// Builds every host stream, scanning what a previous run left on disk,
    /// and registers the configured groups.
    pub fn new(config: &SlogdConfig) -> Result<Self, LogError> {
        let mut factory = StreamFactory::new(&config.root_dir);
        if config.compress {
            factory = factory.with_compressor(Arc::new(GzipCompressor::default()));
        }
        let mut idle_after = Duration::ZERO;
        if let Some(policy) = config.quota.policy() {
            idle_after = policy.window;
            factory = factory.with_quota(policy);
        }

        let mut system = Vec::with_capacity(LogCategory::ALL.len());
        for category in LogCategory::ALL {
            let sizing = config.categories.get(category);
            let mut files = factory.file_set(
                category,
                SYSTEM_STREAM,
                &format!("{SYSTEM_STREAM}_"),
                sizing.file_set_config(),
            )?;
            let report = files.scan_existing()?;
            debug!(
                %category,
                adopted = ?report.adopted,
                retained_bytes = report.retained_bytes,
                "host stream ready"
            );
            system.push(factory.stream(
                format!("{category}/{SYSTEM_STREAM}"),
                sizing.buffer_size(),
                files,
            )?);
        }

        let registry = GroupRegistry::new(Arc::clone(factory.drops()));
        registry.load_from_config(&config.groups, &factory);
        for route in &config.channels {
            registry.set_channel(route.channel, route.module);
        }

        info!(
            root = %config.root_dir.display(),
            groups = registry.len(),
            compress = config.compress,
            quota = config.quota.enabled,
            "log store initialized"
        );
        Ok(Self {
            root: config.root_dir.clone(),
            factory,
            system,
            app_sizing: config.app.clone(),
            apps: Mutex::new(HashMap::new()),
            idle_after,
            registry,
            levels: LevelTable::new(
                config.global_level,
                config.event_enabled,
                config.modules.clone(),
            ),
            flush_errors: RateLimitedLog::default(),
            app_errors: RateLimitedLog::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn levels(&self) -> &LevelTable {
        &self.levels
    }

    /// Host stream of `category`, under `<category dir>/device-os`.
    pub fn system_stream(&self, category: LogCategory) -> &LogStream {
        &self.system[category.index()]
    }

    fn apps(&self) -> MutexGuard<'_, HashMap<AppKey, AppEntry>> {
        #[allow(clippy::expect_used)]
        self.apps.lock().expect("lock poisoned")
    }

    /// Stream of one application pid in one category, created on first use.
    pub fn app_stream(&self, pid: u32, category: LogCategory) -> Result<Arc<LogStream>, LogError> {
        let mut apps = self.apps();
        if let Some(entry) = apps.get(&(pid, category)) {
            return Ok(Arc::clone(&entry.stream));
        }
        let name = format!("{APP_STREAM_PREFIX}{pid}");
        let mut files = self.factory.file_set(
            category,
            &name,
            &format!("{name}_"),
            self.app_sizing.file_set_config(),
        )?;
        files.load_siblings(&category.dir(&self.root), APP_STREAM_PREFIX)?;
        files.scan_existing()?;
        let stream = Arc::new(self.factory.stream(
            format!("{category}/{name}"),
            self.app_sizing.buffer_size(),
            files,
        )?);
        apps.insert(
            (pid, category),
            AppEntry {
                stream: Arc::clone(&stream),
                idle_since: None,
            },
        );
        debug!(pid, %category, "application stream created");
        Ok(stream)
    }

    /// Stages one record in the buffer it routes to.
    ///
    /// App records go to their pid's stream. Debug records go to their
    /// module's group when groups are configured, and are dropped when the
    /// module has none. Everything else goes to the host stream.
    pub fn write(&self, record: &LogRecord) -> Result<(), LogError> {
        if record.is_empty() {
            return Ok(());
        }
        if let Some(pid) = record.app_pid {
            let stream = self.app_stream(pid, record.category).inspect_err(|e| {
                if let Some(n) = self.app_errors.tick() {
                    warn!(pid, occurrences = n, "no stream for application: {e}");
                }
            })?;
            return stream.write(record.persisted_bytes());
        }
        if record.category == LogCategory::Debug && !self.registry.is_empty() {
            return self.registry.write(record.module, &record.payload).map(|_| ());
        }
        self.system_stream(record.category).write(&record.payload)
    }

    /// Appends a device payload to the device's file set, bypassing buffers.
    pub fn write_device(
        &self,
        channel: u32,
        device: u32,
        payload: &[u8],
    ) -> Result<AppendOutcome, LogError> {
        self.registry.write_device(channel, device, payload)
    }

    fn app_streams(&self) -> Vec<(AppKey, Arc<LogStream>)> {
        self.apps()
            .iter()
            .map(|(key, entry)| (*key, Arc::clone(&entry.stream)))
            .collect()
    }

    /// Releases application streams that saw no write for `idle_after`.
    /// A stream still borrowed elsewhere or holding staged bytes is kept.
    /// Returns the number of streams released.
    fn evict_idle_apps(&self, now: Instant) -> usize {
        let mut released = Vec::new();
        self.apps().retain(|(pid, category), entry| {
            if entry.stream.take_touched() {
                entry.idle_since = None;
                return true;
            }
            let since = *entry.idle_since.get_or_insert(now);
            let idle = now.saturating_duration_since(since) >= self.idle_after;
            if !idle || entry.stream.has_pending() || Arc::strong_count(&entry.stream) > 1 {
                return true;
            }
            debug!(pid, %category, "idle application stream released");
            released.push(Arc::clone(&entry.stream));
            false
        });
        for stream in &released {
            if let Err(e) = stream.files().close_active() {
                if let Some(n) = self.flush_errors.tick() {
                    warn!(stream = stream.name(), occurrences = n, "closing idle stream failed: {e}");
                }
            }
        }
        released.len()
    }

    fn flush_stream(&self, stream: &LogStream, summary: &mut FlushSummary) {
        if !stream.has_pending() {
            summary.skipped += 1;
            return;
        }
        match stream.flush() {
            Ok(bytes) => summary.record_flush(bytes),
            Err(e) => {
                summary.failed += 1;
                if let Some(n) = self.flush_errors.tick() {
                    warn!(stream = stream.name(), occurrences = n, "flush failed: {e}");
                }
            }
        }
    }

    fn expire(&self, stream: &LogStream, now: Instant) {
        if let Err(e) = stream.rotate_if_expired(now) {
            if let Some(n) = self.flush_errors.tick() {
                warn!(stream = stream.name(), occurrences = n, "time rotation failed: {e}");
            }
        }
    }

    /// One pass of the periodic worker: drains every non-empty buffer,
    /// closes active files past their storage period and releases idle
    /// application streams.
    pub fn periodic_flush(&self, now: Instant) -> FlushSummary {
        let mut summary = FlushSummary::default();
        for stream in &self.system {
            self.flush_stream(stream, &mut summary);
            self.expire(stream, now);
        }
        for (_, stream) in self.app_streams() {
            self.flush_stream(&stream, &mut summary);
            self.expire(&stream, now);
        }
        summary.merge(self.registry.periodic_flush());
        let released = self.evict_idle_apps(now);
        if released > 0 {
            debug!(released, "released idle application streams");
        }
        summary
    }

    /// Drains the targeted buffers and syncs their active files to disk.
    /// Every stream is attempted; the first failure is returned.
    pub fn flush(&self, target: FlushTarget) -> Result<FlushSummary, LogError> {
        let mut summary = FlushSummary::default();
        let mut first_error = None;
        let mut keep = |result: Result<(), LogError>| {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        };
        let apps = self.app_streams();
        match target {
            FlushTarget::All => {
                for stream in &self.system {
                    self.flush_stream(stream, &mut summary);
                    keep(stream.sync());
                }
                for (_, stream) in &apps {
                    self.flush_stream(stream, &mut summary);
                    keep(stream.sync());
                }
                summary.merge(self.registry.flush_all());
                keep(self.registry.sync_all());
            }
            FlushTarget::App(pid) => {
                for (_, stream) in apps.iter().filter(|((owner, _), _)| *owner == pid) {
                    self.flush_stream(stream, &mut summary);
                    keep(stream.sync());
                }
            }
        }
        if summary.failed > 0 && first_error.is_none() {
            first_error = Some(LogError::ResourceExhausted(format!(
                "{} stream(s) could not be flushed",
                summary.failed
            )));
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    pub fn stats(&self) -> StoreStats {
        let apps = self.app_streams();
        let groups = self.registry.groups();
        let pending_bytes = self
            .system
            .iter()
            .chain(apps.iter().map(|(_, s)| s.as_ref()))
            .chain(groups.iter().map(|g| g.stream()))
            .map(|s| s.buffer().len())
            .sum();
        StoreStats {
            drops: self.factory.drops().snapshot(),
            groups: groups.len(),
            app_streams: apps.len(),
            pending_bytes,
        }
    }

    /// Newest staged bytes of every buffer, without consuming them.
    pub fn collect_snapshot(&self, max_per_buffer: usize) -> Vec<u8> {
        let apps = self.app_streams();
        let groups = self.registry.groups();
        let mut out = Vec::new();
        for stream in self
            .system
            .iter()
            .chain(apps.iter().map(|(_, s)| s.as_ref()))
            .chain(groups.iter().map(|g| g.stream()))
        {
            let handle = stream.buffer().open(AccessMode::Snapshot);
            out.extend(handle.collect_newest(max_per_buffer));
        }
        out
    }

    /// File locations, restricted to the groups whose name starts with
    /// `filter`.
    pub fn patterns(&self, filter: &str) -> LogPatterns {
        LogPatterns {
            root: self.root.clone(),
            group_root: LogCategory::Debug.dir(&self.root),
            group_names: self
                .registry
                .names()
                .into_iter()
                .filter(|name| name.starts_with(filter))
                .collect(),
            suffixes: [PLAIN_SUFFIX, COMPRESSED_SUFFIX, ACTIVE_COMPRESSED_SUFFIX]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Flushes everything, then releases the groups and application streams.
    pub fn shutdown(&self) -> Result<FlushSummary, LogError> {
        let flushed = self.flush(FlushTarget::All);
        self.registry.teardown();
        self.apps().clear();
        info!("log store shut down");
        flushed
    }
}
