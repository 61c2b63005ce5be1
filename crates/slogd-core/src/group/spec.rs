// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::category::LogCategory;
use crate::error::LogError;
use crate::naming::ACTIVE_COMPRESSED_SUFFIX;
use crate::record::ModuleId;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub type GroupId = u32;

pub const MAX_GROUP_NAME_LEN: usize = 64;
pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_FILE_NAME_LEN: usize = 255;

// timestamp plus the longest suffix
const FILE_NAME_TAIL_LEN: usize = 17 + ACTIVE_COMPRESSED_SUFFIX.len();

/// Configuration of one group of modules sharing a buffered stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: GroupId,
    pub name: String,
    pub total_max_file_size_kb: u64,
    pub file_size_kb: u64,
    pub buffer_size_kb: u64,
    /// Modules routed into this group.
    #[serde(default)]
    pub modules: Vec<ModuleId>,
    /// Number of attached devices, each with its own file set.
    #[serde(default)]
    pub devices: u32,
    /// Device logs only, written straight to the device file sets.
    #[serde(default)]
    pub passthrough: bool,
}

impl GroupSpec {
    pub fn buffer_size(&self) -> usize {
        usize::try_from(self.buffer_size_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
    }

    pub fn max_file_size(&self) -> u64 {
        self.file_size_kb.saturating_mul(1024)
    }

    pub fn total_max_file_size(&self) -> u64 {
        self.total_max_file_size_kb.saturating_mul(1024)
    }

    /// Stream directory name of the group, or of one of its devices.
    pub fn stream_name(&self, device: Option<u32>) -> String {
        match device {
            Some(device) => format!("{}-{device}", self.name),
            None => self.name.clone(),
        }
    }

    /// Every stream directory the group owns: its own, then one per device.
    pub fn stream_names(&self) -> Vec<String> {
        std::iter::once(None)
            .chain((0..self.devices).map(Some))
            .map(|device| self.stream_name(device))
            .collect()
    }

    pub fn validate(&self, root: &Path) -> Result<(), LogError> {
        if self.buffer_size_kb == 0 {
            return Err(LogError::InputInvalid(format!(
                "group {}: buffer size must be positive",
                self.name
            )));
        }
        if self.file_size_kb == 0 {
            return Err(LogError::InputInvalid(format!(
                "group {}: file size must be positive",
                self.name
            )));
        }
        if self.name.is_empty() || self.name.len() > MAX_GROUP_NAME_LEN {
            return Err(LogError::InputInvalid(format!(
                "group name must be 1 to {MAX_GROUP_NAME_LEN} bytes, got {:?}",
                self.name
            )));
        }
        if !self
            .name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(LogError::InputInvalid(format!(
                "group name {:?} may only hold letters, digits, '-' and '_'",
                self.name
            )));
        }
        if self.passthrough && self.devices == 0 {
            return Err(LogError::InputInvalid(format!(
                "group {}: passthrough needs at least one device",
                self.name
            )));
        }
        let widest = self.stream_name(self.devices.checked_sub(1));
        let file_name_len = widest.len() + 1 + FILE_NAME_TAIL_LEN;
        let dir = LogCategory::Debug.dir(root).join(&widest);
        let path_len = dir.as_os_str().len() + 1 + file_name_len;
        if file_name_len > MAX_FILE_NAME_LEN || path_len > MAX_PATH_LEN {
            return Err(LogError::InputInvalid(format!(
                "group {}: log path of {path_len} bytes is too long",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: GroupId, name: &str) -> GroupSpec {
        GroupSpec {
            id,
            name: name.to_string(),
            total_max_file_size_kb: 10 * 1024,
            file_size_kb: 1024,
            buffer_size_kb: 64,
            modules: vec![],
            devices: 0,
            passthrough: false,
        }
    }

    #[test]
    fn test_valid_spec() {
        let spec = spec(1, "drv_core-2");
        assert!(spec.validate(Path::new("/var/log/slogd")).is_ok());
        assert_eq!(spec.buffer_size(), 64 * 1024);
        assert_eq!(spec.max_file_size(), 1 << 20);
        assert_eq!(spec.total_max_file_size(), 10 << 20);
    }

    #[test]
    fn test_stream_names_cover_devices() {
        let mut fw = spec(1, "fw");
        assert_eq!(fw.stream_names(), vec!["fw"]);
        fw.devices = 2;
        assert_eq!(fw.stream_names(), vec!["fw", "fw-0", "fw-1"]);
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let root = Path::new("/tmp");
        let mut bad = spec(1, "g");
        bad.buffer_size_kb = 0;
        assert!(matches!(bad.validate(root), Err(LogError::InputInvalid(_))));
        let mut bad = spec(1, "g");
        bad.file_size_kb = 0;
        assert!(bad.validate(root).is_err());
    }

    #[test]
    fn test_rejects_bad_names() {
        let root = Path::new("/tmp");
        let long = "x".repeat(MAX_GROUP_NAME_LEN + 1);
        for name in ["", "a/b", "..", "has space", long.as_str()] {
            assert!(spec(1, name).validate(root).is_err(), "{name:?} accepted");
        }
    }

    #[test]
    fn test_rejects_long_root() {
        let root = format!("/{}", "r".repeat(MAX_PATH_LEN));
        assert!(spec(1, "g").validate(Path::new(&root)).is_err());
    }

    #[test]
    fn test_passthrough_needs_devices() {
        let mut firmware = spec(1, "fw");
        firmware.passthrough = true;
        assert!(firmware.validate(Path::new("/tmp")).is_err());
        firmware.devices = 2;
        assert!(firmware.validate(Path::new("/tmp")).is_ok());
        assert_eq!(firmware.stream_name(Some(1)), "fw-1");
    }
}
