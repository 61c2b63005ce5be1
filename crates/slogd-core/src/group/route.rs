// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::spec::{GroupId, GroupSpec};
use crate::error::LogError;
use crate::record::ModuleId;
use hashbrown::HashMap;

/// Static module → group mapping, plus the device channel → module map.
///
/// Lookups return `None` for anything unmapped; callers drop such records.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    modules: HashMap<ModuleId, GroupId>,
    channels: HashMap<u32, ModuleId>,
}

impl RouteTable {
    /// Checks that none of the group's modules already belongs to another
    /// group.
    pub fn check_group(&self, spec: &GroupSpec) -> Result<(), LogError> {
        for module in &spec.modules {
            if let Some(owner) = self.modules.get(module) {
                if *owner != spec.id {
                    return Err(LogError::ConfigInconsistent(format!(
                        "module {module} of group {} is already routed to group {owner}",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn insert_group(&mut self, spec: &GroupSpec) -> Result<(), LogError> {
        self.check_group(spec)?;
        for module in &spec.modules {
            self.modules.insert(*module, spec.id);
        }
        Ok(())
    }

    pub fn set_channel(&mut self, channel: u32, module: ModuleId) {
        self.channels.insert(channel, module);
    }

    pub fn route_module(&self, module: ModuleId) -> Option<GroupId> {
        self.modules.get(&module).copied()
    }

    pub fn route_channel(&self, channel: u32) -> Option<GroupId> {
        self.channels
            .get(&channel)
            .and_then(|module| self.route_module(*module))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn clear(&mut self) {
        self.modules.clear();
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: GroupId, modules: Vec<ModuleId>) -> GroupSpec {
        GroupSpec {
            id,
            name: format!("g{id}"),
            total_max_file_size_kb: 100,
            file_size_kb: 10,
            buffer_size_kb: 4,
            modules,
            devices: 0,
            passthrough: false,
        }
    }

    #[test]
    fn test_routes_and_sentinel() {
        let mut table = RouteTable::default();
        table.insert_group(&spec(1, vec![10, 11])).unwrap();
        table.insert_group(&spec(2, vec![20])).unwrap();
        assert_eq!(table.route_module(10), Some(1));
        assert_eq!(table.route_module(20), Some(2));
        assert_eq!(table.route_module(0), None);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_module_owned_twice_is_rejected() {
        let mut table = RouteTable::default();
        table.insert_group(&spec(1, vec![10])).unwrap();
        let err = table.insert_group(&spec(2, vec![30, 10])).unwrap_err();
        assert!(matches!(err, LogError::ConfigInconsistent(_)));
        // nothing of the rejected group was inserted
        assert_eq!(table.route_module(30), None);
    }

    #[test]
    fn test_channels_resolve_through_modules() {
        let mut table = RouteTable::default();
        table.insert_group(&spec(3, vec![7])).unwrap();
        table.set_channel(100, 7);
        table.set_channel(101, 8);
        assert_eq!(table.route_channel(100), Some(3));
        assert_eq!(table.route_channel(101), None);
        assert_eq!(table.route_channel(102), None);
    }
}
