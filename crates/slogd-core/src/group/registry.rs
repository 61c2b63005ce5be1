// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::route::RouteTable;
use super::spec::{GroupId, GroupSpec};
use crate::category::LogCategory;
use crate::diag::{DropCounters, DropReason, RateLimitedLog};
use crate::error::LogError;
use crate::file_set::{AppendOutcome, FileSet, FileSetConfig};
use crate::record::ModuleId;
use crate::store::{APP_STREAM_PREFIX, SYSTEM_STREAM};
use crate::stream::{LogStream, StreamFactory};
use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Size of the group configuration table.
pub const MAX_GROUP_SLOTS: usize = 32;

/// A tenant: modules sharing one buffered stream, with optional per-device
/// file sets.
#[derive(Debug)]
pub struct Group {
    // declared first so device state goes before the stream on drop
    devices: Vec<Mutex<FileSet>>,
    stream: LogStream,
    spec: GroupSpec,
    drops: Arc<DropCounters>,
    device_errors: RateLimitedLog,
}

impl Group {
    fn build(spec: GroupSpec, factory: &StreamFactory) -> Result<Self, LogError> {
        let config = FileSetConfig {
            max_file_size: spec.max_file_size(),
            total_max_file_size: spec.total_max_file_size(),
            max_file_num: 0,
            storage_period: None,
        };
        let name = spec.stream_name(None);
        let mut files =
            factory.file_set(LogCategory::Debug, &name, &format!("{name}_"), config.clone())?;
        files.scan_existing()?;
        let stream = factory.stream(name, spec.buffer_size(), files)?;

        let mut devices = Vec::new();
        for device in 0..spec.devices {
            let name = spec.stream_name(Some(device));
            let mut files =
                factory.file_set(LogCategory::Debug, &name, &format!("{name}_"), config.clone())?;
            files.scan_existing()?;
            devices.push(Mutex::new(files));
        }
        Ok(Self {
            devices,
            stream,
            spec,
            drops: Arc::clone(factory.drops()),
            device_errors: RateLimitedLog::default(),
        })
    }

    pub fn id(&self) -> GroupId {
        self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &GroupSpec {
        &self.spec
    }

    pub fn stream(&self) -> &LogStream {
        &self.stream
    }

    pub fn is_passthrough(&self) -> bool {
        self.spec.passthrough
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Stages `payload` in the group's buffer.
    pub fn write(&self, payload: &[u8]) -> Result<(), LogError> {
        self.stream.write(payload)
    }

    /// Appends a device payload straight to that device's file set.
    pub fn write_device(&self, device: u32, payload: &[u8]) -> Result<AppendOutcome, LogError> {
        let Some(files) = self.devices.get(device as usize) else {
            return Err(LogError::InputInvalid(format!(
                "group {} has no device {device}",
                self.spec.name
            )));
        };
        #[allow(clippy::expect_used)]
        let outcome = files.lock().expect("lock poisoned").append(payload);
        match &outcome {
            Ok(AppendOutcome::Throttled) => self.drops.record(DropReason::Quota),
            Err(e) => {
                self.drops.record(DropReason::Io);
                if let Some(n) = self.device_errors.tick() {
                    warn!(group = %self.spec.name, device, occurrences = n, "device write failed: {e}");
                }
            }
            Ok(_) => {}
        }
        outcome
    }

    pub fn flush(&self) -> Result<usize, LogError> {
        self.stream.flush()
    }

    /// Syncs the group's active file and the active file of every device.
    pub fn sync(&self) -> Result<(), LogError> {
        self.stream.sync()?;
        for files in &self.devices {
            #[allow(clippy::expect_used)]
            files.lock().expect("lock poisoned").sync_active()?;
        }
        Ok(())
    }
}

/// Outcome of one flush pass over several streams.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    /// Streams that had staged bytes and drained them.
    pub flushed: usize,
    /// Streams with nothing staged.
    pub skipped: usize,
    pub failed: usize,
    /// Bytes moved out of buffers, before compression.
    pub bytes: usize,
}

impl FlushSummary {
    pub fn record_flush(&mut self, bytes: usize) {
        self.flushed += 1;
        self.bytes += bytes;
    }

    pub fn merge(&mut self, other: FlushSummary) {
        self.flushed += other.flushed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }
}

#[derive(Debug, Default)]
struct Groups {
    groups: Vec<Arc<Group>>,
    by_id: HashMap<GroupId, usize>,
    by_name: HashMap<String, usize>,
    /// Stream directories taken by registered groups and their devices.
    dirs: HashSet<String>,
    routes: RouteTable,
}

impl Groups {
    fn check_unique(&self, spec: &GroupSpec) -> Result<(), LogError> {
        if self.by_id.contains_key(&spec.id) {
            return Err(LogError::ConfigInconsistent(format!(
                "duplicate group id {}",
                spec.id
            )));
        }
        if self.by_name.contains_key(spec.name.as_str()) {
            return Err(LogError::ConfigInconsistent(format!(
                "duplicate group name {}",
                spec.name
            )));
        }
        for dir in spec.stream_names() {
            if dir == SYSTEM_STREAM || dir.starts_with(APP_STREAM_PREFIX) {
                return Err(LogError::ConfigInconsistent(format!(
                    "group {}: stream directory {dir} is reserved",
                    spec.name
                )));
            }
            if self.dirs.contains(dir.as_str()) {
                return Err(LogError::ConfigInconsistent(format!(
                    "group {}: stream directory {dir} already belongs to another group",
                    spec.name
                )));
            }
        }
        self.routes.check_group(spec)
    }
}

/// Registered groups in insertion order, indexed by id and by name.
///
/// The lock guards structure only; writes and flushes go through each
/// group's own buffer and file-set locks.
#[derive(Debug)]
pub struct GroupRegistry {
    inner: RwLock<Groups>,
    drops: Arc<DropCounters>,
    unrouted: RateLimitedLog,
    flush_errors: RateLimitedLog,
}

impl GroupRegistry {
    pub fn new(drops: Arc<DropCounters>) -> Self {
        Self {
            inner: RwLock::new(Groups::default()),
            drops,
            unrouted: RateLimitedLog::default(),
            flush_errors: RateLimitedLog::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Groups> {
        #[allow(clippy::expect_used)]
        self.inner.read().expect("lock poisoned")
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, Groups> {
        #[allow(clippy::expect_used)]
        self.inner.write().expect("lock poisoned")
    }

    /// Validates and registers a group, scanning the files it already has on
    /// disk.
    pub fn add_group(&self, spec: GroupSpec, factory: &StreamFactory) -> Result<Arc<Group>, LogError> {
        spec.validate(factory.root())?;
        self.read().check_unique(&spec)?;
        let group = Arc::new(Group::build(spec, factory)?);

        let mut inner = self.write_lock();
        // another add may have raced us while the group was being built
        inner.check_unique(group.spec())?;
        inner.routes.insert_group(group.spec())?;
        let slot = inner.groups.len();
        inner.by_id.insert(group.id(), slot);
        inner.by_name.insert(group.name().to_string(), slot);
        inner.dirs.extend(group.spec().stream_names());
        inner.groups.push(Arc::clone(&group));
        debug!(
            group = group.name(),
            id = group.id(),
            devices = group.device_count(),
            "group registered"
        );
        Ok(group)
    }

    /// Registers every configured slot of the table. A bad slot is logged
    /// and skipped. Returns the number of groups added.
    pub fn load_from_config(&self, slots: &[Option<GroupSpec>], factory: &StreamFactory) -> usize {
        if slots.len() > MAX_GROUP_SLOTS {
            warn!(
                configured = slots.len(),
                "group table holds more than {MAX_GROUP_SLOTS} slots, ignoring the rest"
            );
        }
        let mut added = 0;
        for (slot, spec) in slots.iter().take(MAX_GROUP_SLOTS).enumerate() {
            let Some(spec) = spec else {
                continue;
            };
            match self.add_group(spec.clone(), factory) {
                Ok(_) => added += 1,
                Err(e) => warn!(slot, group = %spec.name, "skipping group: {e}"),
            }
        }
        info!(groups = added, "group configuration loaded");
        added
    }

    /// Maps a device channel to the module whose group receives its
    /// payloads. A later call for the same channel replaces the mapping.
    pub fn set_channel(&self, channel: u32, module: ModuleId) {
        self.write_lock().routes.set_channel(channel, module);
    }

    pub fn get_by_id(&self, id: GroupId) -> Option<Arc<Group>> {
        let inner = self.read();
        inner.by_id.get(&id).map(|slot| Arc::clone(&inner.groups[*slot]))
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Group>> {
        let inner = self.read();
        inner.by_name.get(name).map(|slot| Arc::clone(&inner.groups[*slot]))
    }

    /// `None` when the module belongs to no group.
    pub fn route_module(&self, module: ModuleId) -> Option<GroupId> {
        self.read().routes.route_module(module)
    }

    /// Group of the module a channel is mapped to. `None` when the channel
    /// is unmapped or its module belongs to no group.
    pub fn route_channel(&self, channel: u32) -> Option<GroupId> {
        self.read().routes.route_channel(channel)
    }

    /// Groups in registration order.
    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.read().groups.clone()
    }

    /// Group names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.read()
            .groups
            .iter()
            .map(|group| group.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().groups.is_empty()
    }

    fn unrouted(&self, what: &str, id: u32) -> LogError {
        self.drops.record(DropReason::Unrouted);
        if let Some(n) = self.unrouted.tick() {
            warn!(occurrences = n, "dropping record from {what} {id}: no group");
        }
        LogError::InputInvalid(format!("{what} {id} is not routed to a group"))
    }

    /// Stages a record of `module` in its group's buffer. Unmapped modules
    /// are dropped and counted.
    pub fn write(&self, module: ModuleId, payload: &[u8]) -> Result<GroupId, LogError> {
        let group = self
            .route_module(module)
            .and_then(|id| self.get_by_id(id))
            .ok_or_else(|| self.unrouted("module", module))?;
        group.write(payload)?;
        Ok(group.id())
    }

    /// Routes a device payload by channel and appends it to that device's
    /// file set.
    pub fn write_device(
        &self,
        channel: u32,
        device: u32,
        payload: &[u8],
    ) -> Result<AppendOutcome, LogError> {
        let group = self
            .route_channel(channel)
            .and_then(|id| self.get_by_id(id))
            .ok_or_else(|| self.unrouted("channel", channel))?;
        group.write_device(device, payload)
    }

    /// Drains every group that has pending data. Passthrough groups hold no
    /// locally staged data and are skipped.
    pub fn periodic_flush(&self) -> FlushSummary {
        self.flush_groups(true)
    }

    /// Drains every group, passthrough ones included.
    pub fn flush_all(&self) -> FlushSummary {
        self.flush_groups(false)
    }

    fn flush_groups(&self, skip_passthrough: bool) -> FlushSummary {
        let mut summary = FlushSummary::default();
        for group in self.groups() {
            if (skip_passthrough && group.is_passthrough()) || !group.stream().has_pending() {
                summary.skipped += 1;
                continue;
            }
            match group.flush() {
                Ok(bytes) => summary.record_flush(bytes),
                Err(e) => {
                    summary.failed += 1;
                    if let Some(n) = self.flush_errors.tick() {
                        warn!(group = group.name(), occurrences = n, "group flush failed: {e}");
                    }
                }
            }
        }
        summary
    }

    /// Syncs every group. Stops at the first failure.
    pub fn sync_all(&self) -> Result<(), LogError> {
        for group in self.groups() {
            group.sync()?;
        }
        Ok(())
    }

    /// Drops every group, device file sets first, and empties the indexes.
    pub fn teardown(&self) {
        let mut inner = self.write_lock();
        let count = inner.groups.len();
        inner.by_id.clear();
        inner.by_name.clear();
        inner.dirs.clear();
        inner.routes.clear();
        inner.groups.clear();
        debug!(groups = count, "group registry torn down");
    }
}
