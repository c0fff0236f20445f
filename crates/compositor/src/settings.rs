use std::path::Path;

use frame_scheduler::SchedulerSettings;
use raster_protocol::{GlobalStateThatImpactsTilePriority, MemoryLimitPolicy, TreePriority};
use serde::{Deserialize, Serialize};
use tile_manager::TileManagerSettings;
use tiles::TilingSettings;

use crate::SettingsError;

/// Memory the tile manager may spend on tile resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPolicySettings {
    pub memory_limit_policy: MemoryLimitPolicy,
    pub bytes_limit_when_visible: usize,
    /// Share of the limit prepaint tiles may use, in percent.
    pub max_memory_for_prepaint_percentage: usize,
    pub num_resources_limit: usize,
}

impl Default for MemoryPolicySettings {
    fn default() -> Self {
        Self {
            memory_limit_policy: MemoryLimitPolicy::AllowAnything,
            bytes_limit_when_visible: 64 * 1024 * 1024,
            max_memory_for_prepaint_percentage: 100,
            num_resources_limit: 10_000_000,
        }
    }
}

impl MemoryPolicySettings {
    pub fn global_state(&self, visible: bool, tree_priority: TreePriority) -> GlobalStateThatImpactsTilePriority {
        if !visible {
            return GlobalStateThatImpactsTilePriority {
                tree_priority,
                ..GlobalStateThatImpactsTilePriority::default()
            };
        }
        GlobalStateThatImpactsTilePriority {
            memory_limit_policy: self.memory_limit_policy,
            soft_memory_limit_in_bytes: self.bytes_limit_when_visible * self.max_memory_for_prepaint_percentage / 100,
            hard_memory_limit_in_bytes: self.bytes_limit_when_visible,
            num_resources_limit: self.num_resources_limit,
            tree_priority,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerTreeSettings {
    pub tiling: TilingSettings,
    pub tile_manager: TileManagerSettings,
    pub scheduler: SchedulerSettings,
    pub memory_policy: MemoryPolicySettings,
}

impl LayerTreeSettings {
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let json = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.tile_manager.validate()?;
        self.scheduler.validate()?;
        if self.memory_policy.max_memory_for_prepaint_percentage > 100 {
            return Err(SettingsError::Invalid(
                "max_memory_for_prepaint_percentage must be at most 100",
            ));
        }
        if self.tiling.default_tile_size.is_empty() {
            return Err(SettingsError::Invalid("default_tile_size must not be empty"));
        }
        Ok(())
    }
}
