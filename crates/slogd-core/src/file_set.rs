// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk state of one output stream.
//!
//! A `FileSet` owns the active file of a stream, rotates it when it would
//! grow past `max_file_size`, and keeps the retained siblings under
//! `total_max_file_size` by evicting the oldest ones. Sibling directories
//! (other application pids of the same category) are purged as whole
//! directories when the stream's budget is breached.

use crate::category::LogCategory;
use crate::compress::Compressor;
use crate::diag::RateLimitedLog;
use crate::error::LogError;
use crate::naming::{self, ActiveFormat, NameClock};
use crate::quota::{ByteQuota, QuotaLabel};
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Permission bits of a file that is still being written.
pub const FILE_MODE: u32 = 0o640;
/// Permission bits of a retained, closed file.
pub const ARCHIVE_MODE: u32 = 0o440;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSetConfig {
    pub max_file_size: u64,
    pub total_max_file_size: u64,
    /// Upper bound on retained files including the active one; 0 disables it.
    pub max_file_num: u32,
    pub storage_period: Option<Duration>,
}

impl FileSetConfig {
    /// Sizing used for category streams: `file_num` files of `file_size`
    /// bytes, one of which is the active file.
    pub fn from_file_count(file_size: u64, file_num: u32) -> Self {
        Self {
            max_file_size: file_size,
            total_max_file_size: file_size.saturating_mul(u64::from(file_num.saturating_sub(1))),
            max_file_num: file_num,
            storage_period: None,
        }
    }
}

/// A directory next to the stream's own, tracked for whole-directory purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingDir {
    pub path: PathBuf,
    pub size: u64,
}

/// What a single [`FileSet::append`] did with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// `bytes` reached the active file; with compression this is the
    /// encoded length.
    Written { bytes: usize },
    /// Nothing to write.
    Empty,
    /// Dropped by the write quota.
    Throttled,
}

/// Result of [`FileSet::append_records`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordsOutcome {
    /// Bytes that reached the active file.
    pub bytes: usize,
    /// Records written.
    pub written: usize,
    /// Records refused by the write quota.
    pub throttled: usize,
}

/// What a directory scan kept, removed and adopted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Existing file selected as the active one, if any.
    pub adopted: Option<String>,
    pub retained_bytes: u64,
    /// Files removed to bring the stream back under budget, oldest first.
    pub evicted: Vec<String>,
    pub purged_dirs: Vec<PathBuf>,
}

/// Files of one stream directory.
///
/// At most one file is active at a time; appends go to it until it would
/// grow past `max_file_size`, then it is closed and a fresh, later-named file
/// takes over. Every scan walks the directory newest first and evicts what no
/// longer fits `total_max_file_size` or `max_file_num`.
///
/// A `FileSet` is not synchronized; callers hold it behind a mutex.
/// Optional collaborators:
///
/// * a [`Compressor`], which turns every append into one gzip member and
///   gives the active file an `.active.log.gz` name until it is closed;
/// * a [`ByteQuota`], which charges appended bytes (after compression) to
///   the stream's window and refuses what does not fit.
#[derive(Debug)]
pub struct FileSet {
    root: PathBuf,
    dir: PathBuf,
    head: String,
    label: QuotaLabel,
    config: FileSetConfig,
    active: Option<String>,
    active_since: Option<Instant>,
    /// Set once the stream has been written to; from then on a scan keeps
    /// one slot free for the active file and never adopts an existing one.
    reserve_active: bool,
    clock: NameClock,
    compressor: Option<Arc<dyn Compressor>>,
    quota: Option<ByteQuota>,
    siblings: Vec<SiblingDir>,
    siblings_size: u64,
    write_errors: RateLimitedLog,
    quota_drops: RateLimitedLog,
    scan_errors: RateLimitedLog,
}

impl FileSet {
    /// Creates the stream `<root>/<category dir>/<stream>/` whose files are
    /// named `<head><timestamp><suffix>`. No file is selected until the next
    /// scan or append.
    pub fn new(
        root: impl Into<PathBuf>,
        category: LogCategory,
        stream: &str,
        head: impl Into<String>,
        config: FileSetConfig,
    ) -> Self {
        let root = root.into();
        let dir = category.dir(&root).join(stream);
        Self {
            root,
            dir,
            head: head.into(),
            label: QuotaLabel::new(category, stream),
            config,
            active: None,
            active_since: None,
            reserve_active: false,
            clock: NameClock::default(),
            compressor: None,
            quota: None,
            siblings: Vec::new(),
            siblings_size: 0,
            write_errors: RateLimitedLog::default(),
            quota_drops: RateLimitedLog::default(),
            scan_errors: RateLimitedLog::default(),
        }
    }

    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Charges every append to `quota`. Refused payloads are reported as
    /// [`AppendOutcome::Throttled`] and never reach disk.
    #[must_use]
    pub fn with_quota(mut self, quota: ByteQuota) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn label(&self) -> &QuotaLabel {
        &self.label
    }

    pub fn config(&self) -> &FileSetConfig {
        &self.config
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Full path of the active file. `None` until the first append or
    /// adoption.
    pub fn active_path(&self) -> Option<PathBuf> {
        self.active.as_ref().map(|name| self.dir.join(name))
    }

    pub fn siblings(&self) -> &[SiblingDir] {
        &self.siblings
    }

    fn active_format(&self) -> ActiveFormat {
        if self.compressor.is_some() {
            ActiveFormat::Compressed
        } else {
            ActiveFormat::Plain
        }
    }

    /// Forgets the active file so the next append selects a fresh one.
    pub fn reset_active(&mut self) {
        self.active = None;
        self.active_since = None;
    }

    /// Records the sibling directories of this stream: entries of `parent`
    /// starting with `prefix`, other than the stream's own directory,
    /// newest first.
    pub fn load_siblings(&mut self, parent: &Path, prefix: &str) -> Result<(), LogError> {
        let entries = match fs::read_dir(parent) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LogError::io(parent, e)),
        };
        let mut found: Vec<(SystemTime, String, SiblingDir)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.starts_with(prefix) || path == self.dir || !path.is_dir() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let size = dir_size(&path);
            found.push((modified, name, SiblingDir { path, size }));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        self.siblings = found.into_iter().map(|(_, _, dir)| dir).collect();
        self.siblings_size = self.siblings.iter().map(|d| d.size).sum();
        debug!(
            dir = %self.dir.display(),
            count = self.siblings.len(),
            bytes = self.siblings_size,
            "sibling directories loaded"
        );
        Ok(())
    }

    /// Walks the stream's files from newest to oldest, keeping as many as
    /// fit the budget and evicting the rest.
    pub fn scan_existing(&mut self) -> Result<ScanReport, LogError> {
        let mut report = ScanReport::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(LogError::io(&self.dir, e)),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
            .filter(|name| naming::matches_stream(name, &self.head))
            .collect();
        names.sort();

        let mut adopt = self.active.is_none() && !self.reserve_active && self.compressor.is_none();
        let mut kept: u32 = u32::from(self.reserve_active);
        let mut retained: u64 = 0;
        let mut evicting = false;

        for name in names.into_iter().rev() {
            let name = match &self.compressor {
                Some(compressor) => self.settle_compressed(name, compressor.as_ref()),
                None => name,
            };
            if self.active.as_deref() == Some(name.as_str()) {
                if !self.reserve_active {
                    kept += 1;
                }
                continue;
            }
            if adopt {
                adopt = false;
                kept += 1;
                self.active = Some(name.clone());
                self.active_since = Some(Instant::now());
                report.adopted = Some(name);
                continue;
            }
            let path = self.dir.join(&name);
            let size = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if !evicting {
                let fits_size = retained + size <= self.config.total_max_file_size;
                let fits_count = self.config.max_file_num == 0 || kept < self.config.max_file_num;
                if fits_size && fits_count {
                    retained += size;
                    kept += 1;
                } else {
                    evicting = true;
                }
            }
            if evicting {
                remove_file(&path).map_err(|e| LogError::io(&path, e))?;
                report.evicted.push(name);
            } else if let Err(e) = set_mode(&path, ARCHIVE_MODE) {
                debug!(path = %path.display(), "could not archive file: {e}");
            }
        }

        report.retained_bytes = retained;
        if evicting {
            report.purged_dirs = self.purge_siblings(0);
        } else if retained + self.siblings_size > self.config.total_max_file_size {
            report.purged_dirs = self.purge_siblings(self.config.total_max_file_size - retained);
        }
        if !report.evicted.is_empty() || !report.purged_dirs.is_empty() {
            debug!(
                dir = %self.dir.display(),
                evicted = report.evicted.len(),
                purged = report.purged_dirs.len(),
                "aged stream files"
            );
        }
        Ok(report)
    }

    /// Brings a leftover file to its closed compressed form: active files
    /// are renamed, plain files are compressed in place.
    fn settle_compressed(&self, name: String, compressor: &dyn Compressor) -> String {
        let path = self.dir.join(&name);
        let (target, result) = if naming::is_active_compressed(&name) {
            let Some(target) = naming::rotated_name(&name) else {
                return name;
            };
            let result = fs::rename(&path, self.dir.join(&target));
            (target, result)
        } else if naming::is_plain(&name) {
            let Some(target) = naming::compressed_name(&name) else {
                return name;
            };
            let result = fs::read(&path)
                .and_then(|raw| compressor.compress(&raw))
                .and_then(|packed| fs::write(self.dir.join(&target), packed))
                .and_then(|()| remove_file(&path));
            (target, result)
        } else {
            return name;
        };
        match result {
            Ok(()) => target,
            Err(e) => {
                if let Some(n) = self.scan_errors.tick() {
                    warn!(path = %path.display(), occurrences = n, "could not compress file: {e}");
                }
                name
            }
        }
    }

    /// Removes sibling directories, newest first, once their cumulative size
    /// reaches `threshold`. Whole directories go, regardless of the age of
    /// the files inside.
    fn purge_siblings(&mut self, threshold: u64) -> Vec<PathBuf> {
        let mut purged = Vec::new();
        if self.siblings.is_empty() || self.siblings_size < threshold {
            return purged;
        }
        let mut cumulative = 0u64;
        for sibling in &mut self.siblings {
            if sibling.size == 0 {
                continue;
            }
            cumulative += sibling.size;
            if cumulative < threshold {
                continue;
            }
            match fs::remove_dir_all(&sibling.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %sibling.path.display(), "could not purge directory: {e}");
                    continue;
                }
            }
            self.siblings_size -= sibling.size;
            sibling.size = 0;
            purged.push(sibling.path.clone());
        }
        self.siblings.retain(|sibling| sibling.size > 0);
        purged
    }

    /// Resolves the file the next `pending_len` bytes go to, rotating the
    /// active file when they would push it past `max_file_size`.
    pub fn select_or_create_active_file(&mut self, pending_len: usize) -> Result<PathBuf, LogError> {
        let Some(active) = self.active.clone() else {
            self.reserve_active = true;
            if let Err(e) = self.scan_existing() {
                if let Some(n) = self.scan_errors.tick() {
                    warn!(dir = %self.dir.display(), occurrences = n, "scan before new file failed: {e}");
                }
            }
            return Ok(self.start_new_file());
        };
        self.reserve_active = true;
        let path = self.dir.join(&active);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            // removed behind our back
            Err(_) => return Ok(self.start_new_file()),
        };
        if size > 0 && size.saturating_add(pending_len as u64) > self.config.max_file_size {
            self.close_active()?;
            self.scan_existing()?;
            return Ok(self.start_new_file());
        }
        Ok(path)
    }

    fn start_new_file(&mut self) -> PathBuf {
        let name = self.clock.next_name(&self.head, self.active_format());
        let path = self.dir.join(&name);
        debug!(path = %path.display(), "new active file");
        self.active = Some(name);
        self.active_since = Some(Instant::now());
        path
    }

    /// Closes the active file: compressed files get their final name, plain
    /// files are synced.
    pub fn close_active(&mut self) -> Result<(), LogError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        self.active_since = None;
        let path = self.dir.join(&active);
        if let (Some(_), Some(rotated)) = (&self.compressor, naming::rotated_name(&active)) {
            return match fs::rename(&path, self.dir.join(rotated)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(LogError::io(&path, e)),
            };
        }
        sync_file(&path)
    }

    /// Flushes the active file to stable storage.
    pub fn sync_active(&self) -> Result<(), LogError> {
        match self.active_path() {
            Some(path) => sync_file(&path),
            None => Ok(()),
        }
    }

    /// Closes the active file once it has been open longer than the
    /// configured storage period. Returns whether it rotated.
    pub fn rotate_if_expired(&mut self, now: Instant) -> Result<bool, LogError> {
        let (Some(period), Some(since)) = (self.config.storage_period, self.active_since) else {
            return Ok(false);
        };
        if now.saturating_duration_since(since) < period {
            return Ok(false);
        }
        self.close_active()?;
        self.scan_existing()?;
        Ok(true)
    }

    /// Persists `payload` to the active file as one unit: it is compressed
    /// and charged to the quota as a whole, then written in a single call.
    ///
    /// Failures are logged at a limited cadence and returned. Nothing is
    /// cached across failures, so the next append resolves the directory and
    /// the active file again.
    pub fn append(&mut self, payload: &[u8]) -> Result<AppendOutcome, LogError> {
        let result = self.try_append(payload);
        self.logged(result)
    }

    /// Persists newline-terminated records, charging the quota record by
    /// record. A trailing fragment without a newline counts as one record.
    ///
    /// Admitted records are batched into as few writes as the file size
    /// allows; refused ones are counted in the outcome and dropped.
    pub fn append_records(&mut self, payload: &[u8]) -> Result<RecordsOutcome, LogError> {
        let result = self.try_append_records(payload);
        self.logged(result)
    }

    /// Whether appends are charged to a write quota.
    pub fn has_quota(&self) -> bool {
        self.quota.is_some()
    }

    fn logged<T>(&self, result: Result<T, LogError>) -> Result<T, LogError> {
        if let Err(e) = &result {
            if let Some(n) = self.write_errors.tick() {
                warn!(dir = %self.dir.display(), occurrences = n, "append failed: {e}");
            }
        }
        result
    }

    fn try_append(&mut self, payload: &[u8]) -> Result<AppendOutcome, LogError> {
        if payload.is_empty() {
            return Ok(AppendOutcome::Empty);
        }
        self.ensure_dirs()?;
        let data = self.encode(payload)?;
        if !self.admit(data.len()) {
            return Ok(AppendOutcome::Throttled);
        }
        let bytes = self.write_active(&data)?;
        Ok(AppendOutcome::Written { bytes })
    }

    fn try_append_records(&mut self, payload: &[u8]) -> Result<RecordsOutcome, LogError> {
        let mut outcome = RecordsOutcome::default();
        if payload.is_empty() {
            return Ok(outcome);
        }
        self.ensure_dirs()?;
        let limit = usize::try_from(self.config.max_file_size).unwrap_or(usize::MAX);
        let mut batch = Vec::with_capacity(payload.len().min(limit));
        for record in payload.split_inclusive(|b| *b == b'\n') {
            let data = self.encode(record)?;
            if !self.admit(data.len()) {
                outcome.throttled += 1;
                continue;
            }
            if !batch.is_empty() && batch.len() + data.len() > limit {
                outcome.bytes += self.write_active(&batch)?;
                batch.clear();
            }
            batch.extend_from_slice(&data);
            outcome.written += 1;
        }
        if !batch.is_empty() {
            outcome.bytes += self.write_active(&batch)?;
        }
        Ok(outcome)
    }

    fn encode<'a>(&self, payload: &'a [u8]) -> Result<Cow<'a, [u8]>, LogError> {
        match &self.compressor {
            Some(compressor) => compressor
                .compress(payload)
                .map(Cow::Owned)
                .map_err(LogError::Compress),
            None => Ok(Cow::Borrowed(payload)),
        }
    }

    /// Charges `len` bytes to the quota. False means the data must be dropped.
    fn admit(&mut self, len: usize) -> bool {
        let Some(quota) = self.quota.as_mut() else {
            return true;
        };
        if quota.check(len, &self.label) {
            return true;
        }
        if let Some(n) = self.quota_drops.tick() {
            warn!(stream = %self.label, occurrences = n, "write quota exceeded, dropping data");
        }
        false
    }

    /// Writes `data` to the active file, rotating first when needed. A short
    /// write fails the whole append.
    fn write_active(&mut self, data: &[u8]) -> Result<usize, LogError> {
        let path = self.select_or_create_active_file(data.len())?;
        let mut file = open_append(&path).map_err(|e| LogError::io(&path, e))?;
        let written = file.write(data).map_err(|e| LogError::io(&path, e))?;
        if written != data.len() {
            return Err(LogError::ShortWrite {
                path,
                written,
                expected: data.len(),
            });
        }
        if let Err(e) = set_mode(&path, FILE_MODE) {
            debug!(path = %path.display(), "could not restore file mode: {e}");
        }
        Ok(written)
    }

    fn ensure_dirs(&self) -> Result<(), LogError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        for top in LogCategory::TOP_LEVEL_DIRS {
            let path = self.root.join(top);
            fs::create_dir_all(&path).map_err(|e| LogError::io(&path, e))?;
        }
        fs::create_dir_all(&self.dir).map_err(|e| LogError::io(&self.dir, e))
    }

    /// Bytes held by the stream's files on disk, active file included.
    pub fn footprint(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| naming::matches_stream(name, &self.head))
            })
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(kind) if kind.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}

fn sync_file(path: &Path) -> Result<(), LogError> {
    match File::open(path) {
        Ok(file) => file.sync_all().map_err(|e| LogError::io(path, e)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LogError::io(path, e)),
    }
}

/// Unlinks a file, making it writable first. A missing file is not an error.
fn remove_file(path: &Path) -> std::io::Result<()> {
    let _ = set_mode(path, FILE_MODE);
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
fn open_append(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(FILE_MODE)
        .open(path)
}

#[cfg(not(unix))]
fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
