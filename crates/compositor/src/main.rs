use std::path::PathBuf;
use std::time::Instant;

use compositor::{CommitPayload, LayerTreeHostImpl, LayerTreeSettings, run_begin_frame};
use frame_scheduler::{Scheduler, SyntheticBeginFrameSource, begin_frame_mailbox};
use log::{info, warn};
use raster_protocol::{LayerId, Occlusion, RasterSourceBuilder, Rgba8, SharedRasterSource};
use tiles::LayerUpdate;
use tiling_data::Region;
use tiling_data::geometry::{LayerRect, LayerSize, rect};

const PAGE_WIDTH: i32 = 1280;
const PAGE_HEIGHT: i32 = 8000;
const VIEWPORT_HEIGHT: i32 = 720;
const STRIPE_HEIGHT: i32 = 160;
const SCROLL_PIXELS_PER_FRAME: i32 = 32;
const FRAME_COUNT: u64 = 300;
const MAILBOX_CAPACITY: usize = 2;
const PAGE_LAYER_ID: LayerId = LayerId(1);

fn main() {
    env_logger::init();
    let settings = match parse_settings_path() {
        Some(path) => LayerTreeSettings::load(&path)
            .unwrap_or_else(|error| panic!("load settings {}: {error}", path.display())),
        None => LayerTreeSettings::default(),
    };
    let interval = settings.scheduler.begin_frame_interval();

    let mut scheduler = Scheduler::new(settings.scheduler).expect("create scheduler");
    let (mut host, commits) = LayerTreeHostImpl::new(settings, scheduler.handle()).expect("create compositor");
    host.set_visible(true);
    scheduler.poll(&mut host);

    commits.submit(CommitPayload {
        layers: vec![page_update(viewport_at(0))],
    });

    let (producer, consumer) = begin_frame_mailbox(MAILBOX_CAPACITY);
    let vsync = std::thread::Builder::new()
        .name("vsync".to_owned())
        .spawn(move || {
            let mut source = SyntheticBeginFrameSource::new(interval);
            for _ in 0..FRAME_COUNT {
                producer.push(source.tick(Instant::now()));
                let now = Instant::now();
                std::thread::sleep(source.next_tick_time(now).saturating_duration_since(now));
            }
            producer.missed_frames()
        })
        .expect("spawn vsync thread");

    let mut scroll_offset = 0;
    let mut last_reported = 0;
    while let Some(args) = consumer.next_with_wait(interval * 4) {
        if host.frames_drawn() > 0 && scroll_offset < PAGE_HEIGHT - VIEWPORT_HEIGHT {
            scroll_offset = (scroll_offset + SCROLL_PIXELS_PER_FRAME).min(PAGE_HEIGHT - VIEWPORT_HEIGHT);
            host.set_scroll_in_progress(true);
            host.scroll_layer_to(PAGE_LAYER_ID, viewport_at(scroll_offset));
        } else if scroll_offset > 0 {
            host.set_scroll_in_progress(false);
        }

        let sequence_number = args.sequence_number;
        let mode = run_begin_frame(&mut scheduler, &mut host, args);
        if let Some(frame) = host.last_frame().filter(|frame| frame.frame_number != last_reported) {
            last_reported = frame.frame_number;
            info!(
                "begin frame {sequence_number} ({mode:?}) offset {scroll_offset}: {}",
                serde_json::to_string(frame).unwrap_or_default()
            );
        }
    }

    let producer_missed = vsync.join().unwrap_or_else(|_| panic!("vsync thread panicked"));
    if producer_missed + consumer.missed_frames() > 0 {
        warn!(
            "{} of {} begin frames missed",
            producer_missed + consumer.missed_frames(),
            consumer.pushed_frames()
        );
    }
    info!(
        "drew {} frames, {:?}",
        host.frames_drawn(),
        host.tile_manager().memory_stats()
    );
}

fn viewport_at(offset: i32) -> LayerRect {
    rect(0, offset, PAGE_WIDTH, VIEWPORT_HEIGHT)
}

/// A tall page of alternating stripes with a solid margin down the side.
fn striped_page() -> SharedRasterSource {
    let mut builder = RasterSourceBuilder::new(LayerSize::new(PAGE_WIDTH, PAGE_HEIGHT))
        .background_color(Rgba8::new(250, 250, 250, 255));
    for (index, top) in (0..PAGE_HEIGHT).step_by(STRIPE_HEIGHT as usize).enumerate() {
        let shade = if index % 2 == 0 { 60 } else { 180 };
        builder = builder.fill_rect(
            rect(PAGE_WIDTH / 5, top, PAGE_WIDTH * 4 / 5, STRIPE_HEIGHT),
            Rgba8::new(shade, 100, 255 - shade, 255),
        );
    }
    builder.build()
}

fn page_update(visible_layer_rect: LayerRect) -> LayerUpdate {
    LayerUpdate {
        layer_id: PAGE_LAYER_ID,
        raster_source: striped_page(),
        invalidation: Region::new(),
        visible_layer_rect,
        ideal_contents_scale: 1.0,
        occlusion: Occlusion::default(),
        is_drawn: true,
    }
}

fn parse_settings_path() -> Option<PathBuf> {
    let mut args = std::env::args_os();
    let _program = args.next();
    let path = args.next()?;
    assert!(
        args.next().is_none(),
        "too many arguments; usage: compositor [<settings.json>]"
    );
    Some(PathBuf::from(path))
}
