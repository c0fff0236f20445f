use std::time::Instant;

use frame_scheduler::{BeginFrameArgs, DeadlineMode, Scheduler};

use crate::host::LayerTreeHostImpl;

/// Runs one begin frame through its deadline.
///
/// Raster completions that arrive before the deadline are applied as they
/// come, so activation can pull the deadline in.
pub fn run_begin_frame(scheduler: &mut Scheduler, host: &mut LayerTreeHostImpl, args: BeginFrameArgs) -> DeadlineMode {
    // Completions land between frames too, and may be what makes this one
    // needed.
    host.poll_completed_tasks();
    let initial_mode = scheduler.begin_frame(host, args);
    loop {
        let now = Instant::now();
        let Some(deadline) = scheduler.deadline_time(now) else {
            break;
        };
        if now >= deadline {
            break;
        }
        let remaining = deadline.saturating_duration_since(now);
        if !host.wait_for_tile_tasks(remaining) {
            std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
        }
        scheduler.poll(host);
    }
    scheduler.on_begin_impl_frame_deadline(host);
    initial_mode
}
