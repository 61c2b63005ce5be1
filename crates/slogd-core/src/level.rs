// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::category::{LogLevel, LEVEL_UNSET};
use crate::record::ModuleId;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// A known producer module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub id: ModuleId,
    pub name: String,
    #[serde(default)]
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleLevel {
    pub id: ModuleId,
    pub name: String,
    /// `LEVEL_UNSET` when the module never had a level.
    pub level: u8,
}

/// Reply to a level query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelReport {
    pub global: LogLevel,
    pub event_enabled: bool,
    pub modules: Vec<ModuleLevel>,
}

impl LevelReport {
    pub fn module_level(&self, id: ModuleId) -> Option<u8> {
        self.modules.iter().find(|m| m.id == id).map(|m| m.level)
    }
}

#[derive(Debug)]
struct Levels {
    global: LogLevel,
    event_enabled: bool,
    modules: Vec<ModuleSpec>,
}

/// Current levels of the daemon and of every known module.
#[derive(Debug)]
pub struct LevelTable {
    levels: RwLock<Levels>,
}

impl LevelTable {
    pub fn new(global: LogLevel, event_enabled: bool, modules: Vec<ModuleSpec>) -> Self {
        Self {
            levels: RwLock::new(Levels {
                global,
                event_enabled,
                modules,
            }),
        }
    }

    pub fn set_global(&self, level: LogLevel) {
        #[allow(clippy::expect_used)]
        let mut levels = self.levels.write().expect("lock poisoned");
        levels.global = level;
    }

    pub fn set_event_enabled(&self, enabled: bool) {
        #[allow(clippy::expect_used)]
        let mut levels = self.levels.write().expect("lock poisoned");
        levels.event_enabled = enabled;
    }

    /// Returns false for unknown modules.
    pub fn set_module(&self, id: ModuleId, level: LogLevel) -> bool {
        #[allow(clippy::expect_used)]
        let mut levels = self.levels.write().expect("lock poisoned");
        match levels.modules.iter_mut().find(|m| m.id == id) {
            Some(module) => {
                module.level = Some(level);
                true
            }
            None => false,
        }
    }

    pub fn report(&self) -> LevelReport {
        #[allow(clippy::expect_used)]
        let levels = self.levels.read().expect("lock poisoned");
        LevelReport {
            global: levels.global,
            event_enabled: levels.event_enabled,
            modules: levels
                .modules
                .iter()
                .map(|m| ModuleLevel {
                    id: m.id,
                    name: m.name.clone(),
                    level: m.level.map_or(LEVEL_UNSET, LogLevel::code),
                })
                .collect(),
        }
    }
}
