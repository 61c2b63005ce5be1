// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::category::LogCategory;
use crate::compress::Compressor;
use crate::diag::{DropCounters, DropReason, RateLimitedLog};
use crate::error::LogError;
use crate::file_set::{AppendOutcome, FileSet, FileSetConfig};
use crate::quota::QuotaPolicy;
use crate::ring_buffer::{AccessMode, Drain, RingBuffer, DEFAULT_READ_UNIT};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, warn};

/// Builds file sets and streams that share the daemon-wide compression,
/// quota policy and drop counters.
#[derive(Debug, Clone)]
pub struct StreamFactory {
    root: PathBuf,
    compressor: Option<Arc<dyn Compressor>>,
    quota: Option<QuotaPolicy>,
    drops: Arc<DropCounters>,
}

impl StreamFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compressor: None,
            quota: None,
            drops: Arc::new(DropCounters::default()),
        }
    }

    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    #[must_use]
    pub fn with_quota(mut self, policy: QuotaPolicy) -> Self {
        self.quota = Some(policy);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn drops(&self) -> &Arc<DropCounters> {
        &self.drops
    }

    pub fn file_set(
        &self,
        category: LogCategory,
        stream: &str,
        head: &str,
        config: FileSetConfig,
    ) -> Result<FileSet, LogError> {
        let footprint = config
            .total_max_file_size
            .saturating_add(config.max_file_size);
        let mut files = FileSet::new(&self.root, category, stream, head, config);
        if let Some(compressor) = &self.compressor {
            files = files.with_compressor(Arc::clone(compressor));
        }
        if let Some(policy) = &self.quota {
            if let Some(quota) = policy.for_stream(category, footprint)? {
                files = files.with_quota(quota);
            }
        }
        Ok(files)
    }

    pub fn stream(
        &self,
        name: impl Into<String>,
        buffer_size: usize,
        files: FileSet,
    ) -> Result<LogStream, LogError> {
        LogStream::new(name, buffer_size, files, Arc::clone(&self.drops))
    }
}

/// A ring buffer paired with the file set it drains into.
///
/// Draining holds the file-set lock for the whole read+append sequence, so
/// two drains of the same stream serialize and bytes reach disk in write
/// order. Producers only ever take the buffer lock.
///
/// When the file set carries a write quota, drained bytes are charged record
/// by record: a record cut at a chunk boundary waits for its tail before it
/// is appended.
#[derive(Debug)]
pub struct LogStream {
    name: String,
    buffer: RingBuffer,
    files: Mutex<FileSet>,
    drain_chunk: usize,
    drops: Arc<DropCounters>,
    /// Set by every write, cleared by [`LogStream::take_touched`].
    touched: AtomicBool,
    oversize: RateLimitedLog,
    drain_errors: RateLimitedLog,
}

impl LogStream {
    pub fn new(
        name: impl Into<String>,
        buffer_size: usize,
        files: FileSet,
        drops: Arc<DropCounters>,
    ) -> Result<Self, LogError> {
        let name = name.into();
        let buffer = RingBuffer::new(name.clone(), buffer_size, DEFAULT_READ_UNIT)?;
        let max_file_size = usize::try_from(files.config().max_file_size).unwrap_or(usize::MAX);
        let drain_chunk = buffer_size.min(max_file_size).max(buffer.read_unit());
        Ok(Self {
            name,
            buffer,
            files: Mutex::new(files),
            drain_chunk,
            drops,
            touched: AtomicBool::new(false),
            oversize: RateLimitedLog::default(),
            drain_errors: RateLimitedLog::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    pub fn files(&self) -> MutexGuard<'_, FileSet> {
        #[allow(clippy::expect_used)]
        self.files.lock().expect("lock poisoned")
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.open(AccessMode::Snapshot).check_empty()
    }

    /// Reports whether the stream was written to since the previous call.
    pub fn take_touched(&self) -> bool {
        self.touched.swap(false, Ordering::AcqRel)
    }

    /// Stages `data`, draining first when it would not fit.
    pub fn write(&self, data: &[u8]) -> Result<(), LogError> {
        if data.is_empty() {
            return Ok(());
        }
        self.touched.store(true, Ordering::Release);
        let handle = self.buffer.open(AccessMode::ReadWrite);
        if handle.check_full(data.len()) && data.len() <= self.buffer.capacity() {
            // a failed drain is reported by drain itself
            let _ = self.flush();
        }
        match handle.write(data, self) {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = if data.len() > self.buffer.capacity() {
                    DropReason::Oversize
                } else {
                    DropReason::Io
                };
                self.drops.record(reason);
                if let Some(n) = self.oversize.tick() {
                    warn!(stream = %self.name, occurrences = n, "dropping record: {e}");
                }
                Err(e)
            }
        }
    }

    /// Moves every staged byte to disk. Returns the number of bytes drained.
    pub fn flush(&self) -> Result<usize, LogError> {
        self.drain(&self.buffer)
    }

    /// Writes straight to the file set, bypassing the buffer.
    pub fn append_direct(&self, data: &[u8]) -> Result<AppendOutcome, LogError> {
        self.touched.store(true, Ordering::Release);
        let outcome = self.files().append(data);
        self.account(&outcome);
        outcome
    }

    pub fn sync(&self) -> Result<(), LogError> {
        self.files().sync_active()
    }

    pub fn rotate_if_expired(&self, now: Instant) -> Result<bool, LogError> {
        self.files().rotate_if_expired(now)
    }

    fn account(&self, outcome: &Result<AppendOutcome, LogError>) {
        match outcome {
            Ok(AppendOutcome::Throttled) => self.drops.record(DropReason::Quota),
            Err(_) => self.drops.record(DropReason::Io),
            Ok(_) => {}
        }
    }

    /// Appends one drained chunk. Without a quota the chunk is written as a
    /// unit; with one, only the complete records accumulated in `carry` are.
    fn persist(&self, files: &mut FileSet, carry: &mut Vec<u8>, chunk: &[u8]) -> Result<(), LogError> {
        if !files.has_quota() {
            let outcome = files.append(chunk);
            self.account(&outcome);
            return outcome.map(|_| ());
        }
        carry.extend_from_slice(chunk);
        let end = match carry.iter().rposition(|b| *b == b'\n') {
            Some(at) => at + 1,
            None if carry.len() < self.drain_chunk => return Ok(()),
            // no record boundary in sight, charge what we have as one record
            None => carry.len(),
        };
        let records: Vec<u8> = carry.drain(..end).collect();
        self.append_records(files, &records)
    }

    /// Appends the fragment left in `carry` once the buffer is empty.
    fn finish(&self, files: &mut FileSet, carry: &mut Vec<u8>) -> Result<(), LogError> {
        if carry.is_empty() {
            return Ok(());
        }
        let fragment = std::mem::take(carry);
        self.append_records(files, &fragment)
    }

    fn append_records(&self, files: &mut FileSet, records: &[u8]) -> Result<(), LogError> {
        match files.append_records(records) {
            Ok(outcome) => {
                self.drops
                    .record_many(DropReason::Quota, outcome.throttled as u64);
                Ok(())
            }
            Err(e) => {
                self.drops.record(DropReason::Io);
                Err(e)
            }
        }
    }

    fn report_discard(&self, e: &LogError) {
        if let Some(n) = self.drain_errors.tick() {
            warn!(stream = %self.name, occurrences = n, "discarded staged bytes after failed append: {e}");
        }
    }
}

impl Drain for LogStream {
    fn drain(&self, buffer: &RingBuffer) -> Result<usize, LogError> {
        let mut files = self.files();
        let handle = buffer.open(AccessMode::ReadWrite);
        let mut carry = Vec::new();
        let mut moved = 0;
        loop {
            let chunk = match handle.read(self.drain_chunk) {
                Ok(chunk) => chunk,
                Err(e) => {
                    handle.reset()?;
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                break;
            }
            moved += chunk.len();
            if let Err(e) = self.persist(&mut files, &mut carry, &chunk) {
                // the file set re-resolves on the next append; what is left
                // staged would only pile up behind the failure
                handle.reset()?;
                self.report_discard(&e);
                return Err(e);
            }
        }
        if let Err(e) = self.finish(&mut files, &mut carry) {
            self.report_discard(&e);
            return Err(e);
        }
        if moved > 0 {
            debug!(stream = %self.name, bytes = moved, "drained buffer");
        }
        Ok(moved)
    }

    /// Holds the file-set lock so no other drain can interleave, and keeps
    /// draining until `data` is staged.
    fn drain_and_stage(&self, buffer: &RingBuffer, data: &[u8]) -> Result<(), LogError> {
        let mut files = self.files();
        let handle = buffer.open(AccessMode::ReadWrite);
        let mut carry = Vec::new();
        while !buffer.try_stage(data) {
            let chunk = handle.read(self.drain_chunk)?;
            if chunk.is_empty() {
                continue;
            }
            if let Err(e) = self.persist(&mut files, &mut carry, &chunk) {
                handle.reset()?;
                carry.clear();
                self.report_discard(&e);
            }
        }
        if let Err(e) = self.finish(&mut files, &mut carry) {
            self.report_discard(&e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn stream(root: &TempDir, buffer_size: usize, max_file_size: u64) -> LogStream {
        let files = FileSet::new(
            root.path(),
            LogCategory::Run,
            "device-os",
            "device-os_",
            FileSetConfig {
                max_file_size,
                total_max_file_size: max_file_size * 100,
                max_file_num: 0,
                storage_period: None,
            },
        );
        LogStream::new("run", buffer_size, files, Arc::new(DropCounters::default())).unwrap()
    }

    fn on_disk(stream: &LogStream) -> Vec<u8> {
        let dir = stream.files().dir().to_path_buf();
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .collect();
        names.sort();
        names.into_iter().flat_map(|p| fs::read(p).unwrap()).collect()
    }

    #[test]
    fn test_nothing_reaches_disk_before_flush() {
        let root = TempDir::new().unwrap();
        let stream = stream(&root, 4096, 1 << 20);
        stream.write(b"staged\n").unwrap();
        assert!(stream.has_pending());
        assert!(!stream.files().dir().exists());
        assert_eq!(stream.flush().unwrap(), 7);
        assert!(!stream.has_pending());
        assert_eq!(on_disk(&stream), b"staged\n");
        assert_eq!(stream.flush().unwrap(), 0);
    }

    #[test]
    fn test_full_buffer_drains_in_order() {
        let root = TempDir::new().unwrap();
        let stream = stream(&root, 1024, 1 << 20);
        let mut expected = Vec::new();
        for i in 0..100 {
            let line = format!("record {i:04}\n");
            stream.write(line.as_bytes()).unwrap();
            expected.extend_from_slice(line.as_bytes());
        }
        stream.flush().unwrap();
        assert_eq!(on_disk(&stream), expected);
    }

    #[test]
    fn test_oversized_record_is_counted() {
        let root = TempDir::new().unwrap();
        let drops = Arc::new(DropCounters::default());
        let files = FileSet::new(
            root.path(),
            LogCategory::Run,
            "device-os",
            "device-os_",
            FileSetConfig::from_file_count(4096, 4),
        );
        let stream = LogStream::new("run", 1024, files, Arc::clone(&drops)).unwrap();
        assert!(stream.write(&[0u8; 2048]).is_err());
        assert_eq!(drops.snapshot().oversize, 1);
    }

    #[test]
    fn test_factory_applies_quota_policy() {
        use crate::quota::DEFAULT_WINDOW;

        let root = TempDir::new().unwrap();
        let factory = StreamFactory::new(root.path()).with_quota(QuotaPolicy {
            // 240 bytes a day is 10 bytes an hour
            budgets: [0, 0, 240, 0],
            window: DEFAULT_WINDOW,
        });
        let files = factory
            .file_set(
                LogCategory::Run,
                "device-os",
                "device-os_",
                FileSetConfig::from_file_count(1024, 4),
            )
            .unwrap();
        let stream = factory.stream("run", 1024, files).unwrap();
        assert_eq!(
            stream.append_direct(b"12345").unwrap(),
            AppendOutcome::Written { bytes: 5 }
        );
        assert_eq!(
            stream.append_direct(b"123456").unwrap(),
            AppendOutcome::Throttled
        );
        assert_eq!(factory.drops().snapshot().quota, 1);
    }

    #[test]
    fn test_buffered_records_are_charged_one_by_one() {
        use crate::quota::DEFAULT_WINDOW;

        let root = TempDir::new().unwrap();
        let factory = StreamFactory::new(root.path()).with_quota(QuotaPolicy {
            // 1 KiB an hour
            budgets: [0, 0, 24 * 1024, 0],
            window: DEFAULT_WINDOW,
        });
        // 1 KiB files make the drain cut records at chunk boundaries
        let files = factory
            .file_set(
                LogCategory::Run,
                "device-os",
                "device-os_",
                FileSetConfig::from_file_count(1024, 64),
            )
            .unwrap();
        let stream = factory.stream("run", 4096, files).unwrap();
        let mut expected = Vec::new();
        for i in 0..40u32 {
            let line = format!("{i:099}\n");
            stream.write(line.as_bytes()).unwrap();
            if i < 10 {
                expected.extend_from_slice(line.as_bytes());
            }
        }
        stream.flush().unwrap();
        assert_eq!(on_disk(&stream), expected);
        assert_eq!(factory.drops().snapshot().quota, 30);
    }

    #[test]
    fn test_touched_flag_clears_on_read() {
        let root = TempDir::new().unwrap();
        let stream = stream(&root, 1024, 1 << 20);
        assert!(!stream.take_touched());
        stream.write(b"x\n").unwrap();
        assert!(stream.take_touched());
        assert!(!stream.take_touched());
    }

    #[test]
    fn test_contended_small_buffer_drops_nothing() {
        use std::thread;

        let root = TempDir::new().unwrap();
        let stream = Arc::new(stream(&root, 1024, 1 << 20));
        let workers: Vec<_> = (0..8u8)
            .map(|id| {
                let stream = Arc::clone(&stream);
                thread::spawn(move || {
                    for n in 0..500u32 {
                        let line = format!("[{id}] {n:06} {}\n", "w".repeat(88));
                        assert_eq!(line.len(), 100);
                        stream.write(line.as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        stream.flush().unwrap();

        assert_eq!(stream.drops.snapshot().total(), 0);
        let persisted = on_disk(&stream);
        assert_eq!(persisted.len(), 8 * 500 * 100);
        let text = String::from_utf8(persisted).unwrap();
        for id in 0..8u8 {
            let tag = format!("[{id}]");
            assert_eq!(text.lines().filter(|l| l.starts_with(&tag)).count(), 500);
        }
    }

    #[test]
    fn test_append_direct_skips_buffer() {
        let root = TempDir::new().unwrap();
        let stream = stream(&root, 1024, 1 << 20);
        stream.append_direct(b"device line\n").unwrap();
        assert!(!stream.has_pending());
        assert_eq!(on_disk(&stream), b"device line\n");
    }

    #[test]
    fn test_concurrent_writers_with_flusher() {
        use std::thread;

        let root = TempDir::new().unwrap();
        let stream = Arc::new(stream(&root, 2048, 8192));
        let mut workers = vec![];
        for id in 0..4u8 {
            let stream = Arc::clone(&stream);
            workers.push(thread::spawn(move || {
                for n in 0..250u32 {
                    let line = format!("[{id}] {n:06}\n");
                    stream.write(line.as_bytes()).unwrap();
                }
            }));
        }
        let flusher = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                for _ in 0..50 {
                    stream.flush().unwrap();
                    thread::yield_now();
                }
            })
        };
        for worker in workers {
            worker.join().unwrap();
        }
        flusher.join().unwrap();
        stream.flush().unwrap();

        let text = String::from_utf8(on_disk(&stream)).unwrap();
        assert_eq!(text.lines().count(), 1000);
        for id in 0..4u8 {
            let ours: Vec<u32> = text
                .lines()
                .filter(|l| l.starts_with(&format!("[{id}]")))
                .map(|l| l[4..].parse().unwrap())
                .collect();
            assert_eq!(ours, (0..250).collect::<Vec<_>>());
        }
    }
}
