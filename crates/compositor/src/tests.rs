use std::time::{Duration, Instant};

use frame_scheduler::{
    BeginFrameArgs, BeginMainFrameState, DrawResult, OutputSurfaceState, Scheduler, SchedulerClient,
    SchedulerMessage,
};
use raster_buffer::{GpuInterface, RasterBackend};
use raster_protocol::{LayerId, WhichTree};
use tile_manager::TileManagerSettings;
use tiles::test_helpers::{fixed_tile_settings, layer_update};
use tiling_data::Region;
use tiling_data::geometry::{LayerRect, LayerSize, rect};

use crate::{CommitPayload, CommitSender, LayerTreeHostImpl, LayerTreeSettings, run_begin_frame};

const INTERVAL: Duration = Duration::from_millis(20);
const MAX_FRAMES: usize = 500;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings() -> LayerTreeSettings {
    LayerTreeSettings {
        tiling: fixed_tile_settings(),
        tile_manager: TileManagerSettings {
            raster_backend: RasterBackend::Bitmap,
            ..TileManagerSettings::default()
        },
        ..LayerTreeSettings::default()
    }
}

fn page(height: i32, visible: LayerRect) -> CommitPayload {
    CommitPayload {
        layers: vec![layer_update(1, LayerSize::new(1000, height), visible)],
    }
}

struct Harness {
    scheduler: Scheduler,
    host: LayerTreeHostImpl,
    commits: CommitSender,
    next_sequence_number: u64,
}

impl Harness {
    fn new(settings: LayerTreeSettings) -> Self {
        init_logging();
        let mut scheduler = Scheduler::new(settings.scheduler).expect("scheduler settings");
        let (mut host, commits) = LayerTreeHostImpl::new(settings, scheduler.handle()).expect("host");
        host.set_visible(true);
        scheduler.poll(&mut host);
        assert_eq!(
            scheduler.state().output_surface_state(),
            OutputSurfaceState::WaitingForFirstCommit
        );
        Self {
            scheduler,
            host,
            commits,
            next_sequence_number: 1,
        }
    }

    /// Runs one frame, then waits for the next tick the way vsync would.
    fn frame(&mut self) {
        let frame_time = Instant::now();
        let args = BeginFrameArgs::new(frame_time, INTERVAL, self.next_sequence_number);
        self.next_sequence_number += 1;
        run_begin_frame(&mut self.scheduler, &mut self.host, args);

        let next_tick = frame_time + INTERVAL;
        let remaining = next_tick.saturating_duration_since(Instant::now());
        if !self.host.wait_for_tile_tasks(remaining) {
            std::thread::sleep(next_tick.saturating_duration_since(Instant::now()));
        }
    }

    fn run_until(&mut self, what: &str, done: impl Fn(&LayerTreeHostImpl) -> bool) {
        for _ in 0..MAX_FRAMES {
            if done(&self.host) {
                return;
            }
            self.frame();
        }
        panic!("{what} never happened: {:#}", self.host.as_value());
    }

    fn drawn_without_checkerboard(host: &LayerTreeHostImpl, after: u64) -> bool {
        host.frames_drawn() > after
            && host
                .last_frame()
                .is_some_and(|frame| !frame.aborted && frame.checkerboard_quads == 0)
    }
}

#[test]
fn first_commit_is_rastered_before_it_is_drawn() {
    let mut harness = Harness::new(settings());
    harness.commits.submit(page(1000, rect(0, 0, 1000, 600)));
    harness.run_until("first draw", |host| host.frames_drawn() >= 1);

    let frame = *harness.host.last_frame().expect("drawn frame");
    assert!(frame.quads > 0);
    assert_eq!(frame.checkerboard_quads, 0);
    assert_eq!(frame.resource_quads + frame.solid_color_quads, frame.quads);
    assert!(frame.ready_to_draw);
    assert!(!harness.host.trees().has_pending_tree());
    assert_eq!(harness.host.trees().active_tree().layers().len(), 1);
    assert_eq!(
        harness.scheduler.state().output_surface_state(),
        OutputSurfaceState::Active
    );
    assert!(harness.host.tile_manager().memory_stats().resources_in_use > 0);
}

#[test]
fn main_frame_without_a_queued_commit_finishes_early() {
    let mut harness = Harness::new(settings());
    harness
        .scheduler
        .handle()
        .send(SchedulerMessage::SetNeedsBeginMainFrame);
    harness.frame();

    let state = harness.scheduler.state();
    assert_eq!(state.begin_main_frame_state(), BeginMainFrameState::Idle);
    assert!(!state.has_pending_tree());
    assert_eq!(state.output_surface_state(), OutputSurfaceState::Active);
    assert!(harness.host.trees().active_tree().layers().is_empty());
    assert_eq!(harness.host.frames_drawn(), 0);
}

#[test]
fn scrolling_to_new_content_rasters_it_and_redraws() {
    let mut harness = Harness::new(settings());
    harness.commits.submit(page(3000, rect(0, 0, 1000, 600)));
    harness.run_until("first clean draw", |host| Harness::drawn_without_checkerboard(host, 0));

    let drawn = harness.host.frames_drawn();
    let scrolled = rect(0, 2000, 1000, 600);
    harness.host.scroll_layer_to(LayerId(1), scrolled);
    harness.run_until("clean draw after scroll", |host| {
        Harness::drawn_without_checkerboard(host, drawn)
    });

    let layer = harness
        .host
        .trees()
        .layer(WhichTree::Active, LayerId(1))
        .expect("active layer");
    assert_eq!(layer.visible_layer_rect(), scrolled);
}

#[test]
fn checkerboarded_draws_abort_while_scrolling_but_not_when_forced() {
    init_logging();
    let mut settings = settings();
    settings.scheduler.commit_to_active_tree = true;
    let scheduler = Scheduler::new(settings.scheduler).expect("scheduler settings");
    let (mut host, commits) = LayerTreeHostImpl::new(settings, scheduler.handle()).expect("host");

    commits.submit(page(1000, rect(0, 0, 1000, 600)));
    host.scheduled_action_send_begin_main_frame(&BeginFrameArgs::new(Instant::now(), INTERVAL, 1));
    host.scheduled_action_commit();
    assert_eq!(host.trees().active_tree().layers().len(), 1);

    host.set_scroll_in_progress(true);
    assert_eq!(
        host.scheduled_action_draw_and_swap_if_possible(),
        DrawResult::AbortedCheckerboardAnimations
    );
    let aborted = *host.last_frame().expect("attempted frame");
    assert!(aborted.aborted);
    assert!(aborted.checkerboard_quads > 0);
    assert_eq!(host.frames_drawn(), 0);

    assert_eq!(host.scheduled_action_draw_and_swap_forced(), DrawResult::Success);
    let forced = *host.last_frame().expect("forced frame");
    assert!(forced.forced);
    assert!(!forced.aborted);
    assert!(forced.checkerboard_quads > 0);
    assert_eq!(host.frames_drawn(), 1);

    host.set_scroll_in_progress(false);
    host.set_requires_high_res_to_draw(true);
    assert_eq!(
        host.scheduled_action_draw_and_swap_if_possible(),
        DrawResult::AbortedMissingHighResContent
    );
    host.set_requires_high_res_to_draw(false);
    assert_eq!(host.scheduled_action_draw_and_swap_if_possible(), DrawResult::Success);
}

#[test]
fn lost_context_gets_a_new_output_surface_and_rasters_again() {
    let mut harness = Harness::new(settings());
    harness.commits.submit(page(1000, rect(0, 0, 1000, 600)));
    harness.run_until("first clean draw", |host| Harness::drawn_without_checkerboard(host, 0));
    assert_eq!(harness.host.context_id(), 1);

    let drawn = harness.host.frames_drawn();
    harness.host.gpu().lose_context();
    harness.host.scroll_layer_to(LayerId(1), rect(0, 0, 1000, 600));
    harness.run_until("clean draw on a new context", |host| {
        host.context_id() == 2 && Harness::drawn_without_checkerboard(host, drawn)
    });

    assert!(!harness.host.gpu().is_context_lost());
    assert!(harness.host.gpu().live_textures() > 0);
    assert!(!harness.host.tile_manager().is_context_lost());
}

#[test]
fn queued_commits_merge_their_invalidations() {
    let mut first = page(1000, rect(0, 0, 1000, 600));
    first.layers[0].invalidation = Region::from_rect(rect(0, 0, 10, 10));
    let mut second = page(1000, rect(0, 100, 1000, 600));
    second.layers[0].invalidation = Region::from_rect(rect(500, 500, 10, 10));
    second.layers.push(layer_update(2, LayerSize::new(200, 200), rect(0, 0, 200, 200)));

    first.merge(second);
    assert_eq!(first.layers.len(), 2);
    let merged = &first.layers[0];
    assert_eq!(merged.visible_layer_rect, rect(0, 100, 1000, 600));
    assert!(merged.invalidation.contains_rect(&rect(0, 0, 10, 10)));
    assert!(merged.invalidation.contains_rect(&rect(500, 500, 10, 10)));
}

#[test]
fn as_value_reports_frames_and_tile_memory() {
    let mut harness = Harness::new(settings());
    harness.commits.submit(page(1000, rect(0, 0, 1000, 600)));
    harness.run_until("first draw", |host| host.frames_drawn() >= 1);

    let value = harness.host.as_value();
    assert_eq!(value["frames_drawn"], harness.host.frames_drawn());
    assert_eq!(value["context_id"], 1);
    assert!(value["last_frame"]["quads"].as_u64().is_some_and(|quads| quads > 0));
    assert!(value["tile_manager"]["memory"]["resources_in_use"].is_u64());
    assert!(harness.scheduler.as_value(Instant::now())["frames_started"].as_u64() > Some(0));
}
