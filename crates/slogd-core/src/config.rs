// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration.
//!
//! Loaded in priority order:
//! 1. Defaults
//! 2. YAML file (`/etc/slogd/slogd.yaml`, or the path in `SLOGD_CONFIG`)
//! 3. Environment variables prefixed with `SLOGD_`, nested keys split on `__`
//!    (e.g. `SLOGD_QUOTA__ENABLED=true`)

use crate::category::{LogCategory, LogLevel};
use crate::error::ConfigError;
use crate::file_set::FileSetConfig;
use crate::group::{GroupSpec, MAX_GROUP_SLOTS};
use crate::level::ModuleSpec;
use crate::quota::{QuotaPolicy, DAY};
use crate::record::ModuleId;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/slogd/slogd.yaml";
pub const CONFIG_PATH_ENV: &str = "SLOGD_CONFIG";
pub const ENV_PREFIX: &str = "SLOGD_";

/// Sizing of one category (or application) stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub file_size_kb: u64,
    /// Files kept on disk, the active one included.
    pub file_num: u32,
    pub buffer_size_kb: u64,
    /// Close the active file after it has been open this long.
    pub storage_period_secs: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            file_size_kb: 2048,
            file_num: 8,
            buffer_size_kb: 256,
            storage_period_secs: None,
        }
    }
}

impl StreamConfig {
    fn sized(file_size_kb: u64, file_num: u32, buffer_size_kb: u64) -> Self {
        Self {
            file_size_kb,
            file_num,
            buffer_size_kb,
            storage_period_secs: None,
        }
    }

    pub fn buffer_size(&self) -> usize {
        usize::try_from(self.buffer_size_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
    }

    pub fn file_set_config(&self) -> FileSetConfig {
        FileSetConfig {
            storage_period: self.storage_period_secs.map(Duration::from_secs),
            ..FileSetConfig::from_file_count(self.file_size_kb.saturating_mul(1024), self.file_num)
        }
    }

    fn validate(&self, what: &str) -> Result<(), ConfigError> {
        if self.file_size_kb == 0 {
            return Err(ConfigError::Invalid(format!("{what}: file_size_kb must be positive")));
        }
        if self.file_num < 2 {
            return Err(ConfigError::Invalid(format!(
                "{what}: file_num must be at least 2, got {}",
                self.file_num
            )));
        }
        if self.buffer_size_kb == 0 {
            return Err(ConfigError::Invalid(format!("{what}: buffer_size_kb must be positive")));
        }
        if self.storage_period_secs == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "{what}: storage_period_secs must be positive when set"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoriesConfig {
    pub debug: StreamConfig,
    pub security: StreamConfig,
    pub run: StreamConfig,
    pub event: StreamConfig,
}

impl Default for CategoriesConfig {
    fn default() -> Self {
        Self {
            debug: StreamConfig::default(),
            security: StreamConfig::sized(512, 4, 64),
            run: StreamConfig::sized(1024, 8, 128),
            event: StreamConfig::sized(1024, 4, 64),
        }
    }
}

impl CategoriesConfig {
    pub fn get(&self, category: LogCategory) -> &StreamConfig {
        match category {
            LogCategory::Debug => &self.debug,
            LogCategory::Security => &self.security,
            LogCategory::Run => &self.run,
            LogCategory::Event => &self.event,
        }
    }
}

/// Daily byte budgets, in KiB. Zero leaves the category unthrottled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaBudgets {
    pub debug_kb: u64,
    pub security_kb: u64,
    pub run_kb: u64,
    pub event_kb: u64,
}

impl Default for QuotaBudgets {
    fn default() -> Self {
        Self {
            debug_kb: 500 * 1024,
            security_kb: 0,
            run_kb: 200 * 1024,
            event_kb: 100 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub budgets: QuotaBudgets,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: 3600,
            budgets: QuotaBudgets::default(),
        }
    }
}

impl QuotaConfig {
    /// Policy handed to the stream factory, `None` when quotas are off.
    pub fn policy(&self) -> Option<QuotaPolicy> {
        if !self.enabled {
            return None;
        }
        let kb = |n: u64| n.saturating_mul(1024);
        Some(QuotaPolicy {
            budgets: [
                kb(self.budgets.debug_kb),
                kb(self.budgets.security_kb),
                kb(self.budgets.run_kb),
                kb(self.budgets.event_kb),
            ],
            window: Duration::from_secs(self.window_secs),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Collections allowed in flight at once.
    pub max_pending: usize,
    /// Newest bytes taken from each buffer.
    pub snapshot_kb: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            max_pending: 10,
            snapshot_kb: 64,
        }
    }
}

/// Device channel bound to a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRoute {
    pub channel: u32,
    pub module: ModuleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct SlogdConfig {
    pub root_dir: PathBuf,
    /// Filter of the daemon's own diagnostics, in `EnvFilter` syntax.
    pub log_level: String,
    pub flush_interval_ms: u64,
    pub compress: bool,
    pub categories: CategoriesConfig,
    pub app: StreamConfig,
    pub quota: QuotaConfig,
    pub global_level: LogLevel,
    pub event_enabled: bool,
    pub modules: Vec<ModuleSpec>,
    pub channels: Vec<ChannelRoute>,
    /// Fixed-size group table; `null` marks an unconfigured slot.
    pub groups: Vec<Option<GroupSpec>>,
    pub collect: CollectConfig,
}

impl Default for SlogdConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/log/slogd"),
            log_level: "info".to_string(),
            flush_interval_ms: 1000,
            compress: false,
            categories: CategoriesConfig::default(),
            app: StreamConfig::sized(1024, 4, 64),
            quota: QuotaConfig::default(),
            global_level: LogLevel::Info,
            event_enabled: true,
            modules: Vec::new(),
            channels: Vec::new(),
            groups: Vec::new(),
            collect: CollectConfig::default(),
        }
    }
}

impl SlogdConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.root_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "root_dir must be absolute, got {}",
                self.root_dir.display()
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush_interval_ms must be positive".to_string(),
            ));
        }
        for category in LogCategory::ALL {
            self.categories
                .get(category)
                .validate(&format!("categories.{category}"))?;
        }
        self.app.validate("app")?;
        if self.quota.enabled
            && (self.quota.window_secs == 0 || self.quota.window_secs > DAY.as_secs())
        {
            return Err(ConfigError::Invalid(format!(
                "quota.window_secs must be within 1..={}, got {}",
                DAY.as_secs(),
                self.quota.window_secs
            )));
        }
        if self.collect.max_pending == 0 {
            return Err(ConfigError::Invalid(
                "collect.max_pending must be positive".to_string(),
            ));
        }
        if self.groups.len() > MAX_GROUP_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "at most {MAX_GROUP_SLOTS} group slots, got {}",
                self.groups.len()
            )));
        }
        Ok(())
    }
}

/// Loads the configuration from `path` (when it exists) and the environment.
pub fn load_from(path: &Path) -> Result<SlogdConfig, ConfigError> {
    let config: SlogdConfig = Figment::new()
        .merge(Serialized::defaults(SlogdConfig::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Loads the configuration from the default location.
pub fn load() -> Result<SlogdConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV).map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    load_from(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = SlogdConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
        assert!(config.quota.policy().is_none());
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = load_from(Path::new("missing.yaml")).unwrap();
            assert_eq!(config, SlogdConfig::default());
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_parse_config_file() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "slogd.yaml",
                r"
                root_dir: /data/log
                compress: true
                categories:
                  run:
                    file_size_kb: 64
                    file_num: 3
                modules:
                  - id: 7
                    name: drv
                    level: warn
                channels:
                  - channel: 40
                    module: 7
                groups:
                  - id: 1
                    name: drv
                    total_max_file_size_kb: 10240
                    file_size_kb: 1024
                    buffer_size_kb: 64
                    modules: [7]
                  - null
                  - id: 2
                    name: fw
                    total_max_file_size_kb: 1024
                    file_size_kb: 256
                    buffer_size_kb: 16
                    devices: 2
                    passthrough: true
                ",
            )?;
            let config = load_from(Path::new("slogd.yaml")).unwrap();
            assert_eq!(config.root_dir, PathBuf::from("/data/log"));
            assert!(config.compress);
            assert_eq!(config.categories.run.file_size_kb, 64);
            assert_eq!(config.categories.run.file_num, 3);
            // untouched fields keep their defaults
            assert_eq!(config.categories.run.buffer_size_kb, 128);
            assert_eq!(config.modules[0].level, Some(LogLevel::Warn));
            assert_eq!(config.channels, vec![ChannelRoute { channel: 40, module: 7 }]);
            assert_eq!(config.groups.len(), 3);
            assert!(config.groups[1].is_none());
            let fw = config.groups[2].as_ref().unwrap();
            assert!(fw.passthrough);
            assert_eq!(fw.devices, 2);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "slogd.yaml",
                r"
                flush_interval_ms: 500
                quota:
                  enabled: false
                ",
            )?;
            jail.set_env("SLOGD_FLUSH_INTERVAL_MS", "250");
            jail.set_env("SLOGD_QUOTA__ENABLED", "true");
            jail.set_env("SLOGD_QUOTA__BUDGETS__RUN_KB", "24");
            let config = load_from(Path::new("slogd.yaml")).unwrap();
            assert_eq!(config.flush_interval_ms, 250);
            let policy = config.quota.policy().unwrap();
            assert_eq!(policy.budgets[LogCategory::Run.index()], 24 * 1024);
            assert_eq!(policy.window, Duration::from_secs(3600));
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("custom.yaml", "log_level: debug")?;
            jail.set_env(CONFIG_PATH_ENV, "custom.yaml");
            let config = load().unwrap();
            assert_eq!(config.log_level, "debug");
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_invalid_file_is_a_parse_error() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("slogd.yaml", "flush_interval_ms: soon")?;
            let err = load_from(Path::new("slogd.yaml")).unwrap_err();
            assert!(matches!(err, ConfigError::Parse(_)));
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_relative_root() {
        let config = SlogdConfig {
            root_dir: PathBuf::from("log"),
            ..SlogdConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = SlogdConfig {
            flush_interval_ms: 0,
            ..SlogdConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_single_file_streams() {
        let mut config = SlogdConfig::default();
        config.categories.security.file_num = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_quota_window() {
        let mut config = SlogdConfig::default();
        config.quota.enabled = true;
        config.quota.window_secs = 0;
        assert!(config.validate().is_err());
        config.quota.window_secs = 2 * 24 * 3600;
        assert!(config.validate().is_err());
        config.quota.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_group_table() {
        let config = SlogdConfig {
            groups: vec![None; MAX_GROUP_SLOTS + 1],
            ..SlogdConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stream_config_sizing() {
        let stream = StreamConfig {
            storage_period_secs: Some(60),
            ..StreamConfig::sized(4, 3, 1)
        };
        let files = stream.file_set_config();
        assert_eq!(files.max_file_size, 4096);
        assert_eq!(files.total_max_file_size, 8192);
        assert_eq!(files.max_file_num, 3);
        assert_eq!(files.storage_period, Some(Duration::from_secs(60)));
        assert_eq!(stream.buffer_size(), 1024);
    }
}
