use raster_buffer::{DEFAULT_MAX_BYTES_PER_COPY_OPERATION, ProviderSettings, RasterBackend};
use raster_protocol::ResourceFormat;
use serde::{Deserialize, Serialize};

use crate::TileManagerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileManagerSettings {
    /// Most raster tasks one prepare-tiles pass may have scheduled.
    pub scheduled_raster_task_limit: usize,
    pub use_partial_raster: bool,
    pub num_raster_threads: usize,
    pub raster_backend: RasterBackend,
    pub max_bytes_per_copy_operation: usize,
    pub max_staging_buffer_count: usize,
    pub resource_format: ResourceFormat,
}

impl Default for TileManagerSettings {
    fn default() -> Self {
        Self {
            scheduled_raster_task_limit: 32,
            use_partial_raster: false,
            num_raster_threads: 2,
            raster_backend: RasterBackend::default(),
            max_bytes_per_copy_operation: DEFAULT_MAX_BYTES_PER_COPY_OPERATION,
            max_staging_buffer_count: 32,
            resource_format: ResourceFormat::Rgba8888,
        }
    }
}

impl TileManagerSettings {
    pub fn validate(&self) -> Result<(), TileManagerError> {
        if self.num_raster_threads == 0 {
            return Err(TileManagerError::InvalidSettings("num_raster_threads must be at least 1"));
        }
        if self.scheduled_raster_task_limit == 0 {
            return Err(TileManagerError::InvalidSettings(
                "scheduled_raster_task_limit must be at least 1",
            ));
        }
        if self.max_bytes_per_copy_operation == 0 {
            return Err(TileManagerError::InvalidSettings(
                "max_bytes_per_copy_operation must be at least 1",
            ));
        }
        if self.max_staging_buffer_count == 0 {
            return Err(TileManagerError::InvalidSettings(
                "max_staging_buffer_count must be at least 1",
            ));
        }
        Ok(())
    }

    pub const fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            backend: self.raster_backend,
            format: self.resource_format,
            max_bytes_per_copy_operation: self.max_bytes_per_copy_operation,
            max_staging_buffer_count: self.max_staging_buffer_count,
            use_partial_raster: self.use_partial_raster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let settings: TileManagerSettings = serde_json::from_str("{}").expect("valid json");
        assert_eq!(settings, TileManagerSettings::default());
        assert_eq!(settings.scheduled_raster_task_limit, 32);
        assert_eq!(settings.max_bytes_per_copy_operation, 4 * 1024 * 1024);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn backend_and_format_use_their_wire_names() {
        let settings: TileManagerSettings =
            serde_json::from_str(r#"{"raster_backend": "gpu", "resource_format": "RGBA_4444"}"#)
                .expect("valid json");
        assert_eq!(settings.raster_backend, RasterBackend::Gpu);
        assert_eq!(settings.resource_format, ResourceFormat::Rgba4444);
        assert_eq!(settings.provider_settings().backend, RasterBackend::Gpu);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let no_threads = TileManagerSettings {
            num_raster_threads: 0,
            ..TileManagerSettings::default()
        };
        assert!(matches!(no_threads.validate(), Err(TileManagerError::InvalidSettings(_))));

        let no_tasks = TileManagerSettings {
            scheduled_raster_task_limit: 0,
            ..TileManagerSettings::default()
        };
        assert!(no_tasks.validate().is_err());

        let no_copy_budget = TileManagerSettings {
            max_bytes_per_copy_operation: 0,
            ..TileManagerSettings::default()
        };
        assert!(no_copy_budget.validate().is_err());
    }
}
