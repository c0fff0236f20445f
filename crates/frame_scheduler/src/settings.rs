use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Lets the main thread start the next frame while the previous commit
    /// is still waiting to activate.
    pub main_frame_before_activation_enabled: bool,
    /// Commits land directly in the active tree, skipping the pending tree.
    pub commit_to_active_tree: bool,
    pub timeout_and_draw_when_animation_checkerboards: bool,
    pub maximum_number_of_failed_draws_before_draw_is_forced: u32,
    pub max_pending_swaps: u32,
    pub using_synchronous_renderer_compositor: bool,
    pub begin_frame_interval_micros: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            main_frame_before_activation_enabled: false,
            commit_to_active_tree: false,
            timeout_and_draw_when_animation_checkerboards: true,
            maximum_number_of_failed_draws_before_draw_is_forced: 3,
            max_pending_swaps: 1,
            using_synchronous_renderer_compositor: false,
            begin_frame_interval_micros: 16_666,
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_pending_swaps == 0 {
            return Err(SchedulerError::InvalidSettings("max_pending_swaps must be at least 1"));
        }
        if self.maximum_number_of_failed_draws_before_draw_is_forced == 0 {
            return Err(SchedulerError::InvalidSettings(
                "maximum_number_of_failed_draws_before_draw_is_forced must be at least 1",
            ));
        }
        if self.begin_frame_interval_micros == 0 {
            return Err(SchedulerError::InvalidSettings(
                "begin_frame_interval_micros must be at least 1",
            ));
        }
        if self.commit_to_active_tree && self.main_frame_before_activation_enabled {
            return Err(SchedulerError::InvalidSettings(
                "main frame before activation needs a pending tree",
            ));
        }
        Ok(())
    }

    pub const fn begin_frame_interval(&self) -> Duration {
        Duration::from_micros(self.begin_frame_interval_micros)
    }
}
