// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fixed log classes. Each one has its own directory under the log root.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    #[display("debug")]
    Debug,
    #[display("security")]
    Security,
    #[display("run")]
    Run,
    #[display("event")]
    Event,
}

impl LogCategory {
    pub const ALL: [LogCategory; 4] = [
        LogCategory::Debug,
        LogCategory::Security,
        LogCategory::Run,
        LogCategory::Event,
    ];

    /// Directories created under the root before any stream directory.
    pub const TOP_LEVEL_DIRS: [&'static str; 3] = ["debug", "security", "run"];

    pub fn index(self) -> usize {
        match self {
            LogCategory::Debug => 0,
            LogCategory::Security => 1,
            LogCategory::Run => 2,
            LogCategory::Event => 3,
        }
    }

    /// Directory holding this category's streams, relative to the log root.
    /// Events share the run directory.
    pub fn relative_dir(self) -> PathBuf {
        match self {
            LogCategory::Debug => PathBuf::from("debug"),
            LogCategory::Security => PathBuf::from("security"),
            LogCategory::Run => PathBuf::from("run"),
            LogCategory::Event => Path::new("run").join("event"),
        }
    }

    pub fn dir(self, root: &Path) -> PathBuf {
        root.join(self.relative_dir())
    }
}

/// Record severity, ordered from most to least verbose.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[display("debug")]
    Debug = 0,
    #[display("info")]
    Info = 1,
    #[display("warn")]
    Warn = 2,
    #[display("error")]
    Error = 3,
    #[display("null")]
    Null = 4,
}

/// Reported for modules that never had a level assigned.
pub const LEVEL_UNSET: u8 = LogLevel::Null as u8 + 1;

impl LogLevel {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_dirs() {
        let root = Path::new("/var/log/slogd");
        assert_eq!(
            LogCategory::Debug.dir(root),
            PathBuf::from("/var/log/slogd/debug")
        );
        assert_eq!(
            LogCategory::Event.dir(root),
            PathBuf::from("/var/log/slogd/run/event")
        );
    }

    #[test]
    fn test_category_index_is_dense() {
        for (i, category) in LogCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }

    #[test]
    fn test_level_codes() {
        assert_eq!(LogLevel::Debug.code(), 0);
        assert_eq!(LogLevel::Null.code(), 4);
        assert_eq!(LEVEL_UNSET, 5);
        assert!(LogLevel::Warn > LogLevel::Info);
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }
}
