use std::sync::Arc;
use std::time::Duration;

use raster_buffer::{GpuCommand, RasterBackend, RecordingGpu, decode_pixel};
use raster_protocol::{
    GlobalStateThatImpactsTilePriority, MemoryLimitPolicy, RasterSourceBuilder, ResourceFormat, Rgba8,
    TreePriority,
};
use tiles::test_helpers::{fixed_tile_settings, layer_update};
use tiles::{DrawMode, LayerTrees};
use tiling_data::Region;
use tiling_data::geometry::{LayerRect, LayerSize, rect};

use crate::{TileManager, TileManagerError, TileManagerNotification, TileManagerSettings};

const MIB: usize = 1024 * 1024;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn full(size: i32) -> LayerRect {
    rect(0, 0, size, size)
}

fn pending_trees(size: i32) -> LayerTrees {
    let mut trees = LayerTrees::new(fixed_tile_settings());
    trees.commit(vec![layer_update(1, LayerSize::new(size, size), full(size))]);
    trees.update_tile_priorities(1.0);
    trees
}

fn active_trees(size: i32) -> LayerTrees {
    let mut trees = LayerTrees::new(fixed_tile_settings());
    trees.commit_to_active_tree(vec![layer_update(1, LayerSize::new(size, size), full(size))]);
    trees.update_tile_priorities(1.0);
    trees
}

fn manager(settings: TileManagerSettings) -> (TileManager, Arc<RecordingGpu>) {
    let gpu = Arc::new(RecordingGpu::default());
    let manager = TileManager::new(settings, gpu.clone()).expect("tile manager");
    (manager, gpu)
}

fn bitmap_settings() -> TileManagerSettings {
    TileManagerSettings {
        raster_backend: RasterBackend::Bitmap,
        ..TileManagerSettings::default()
    }
}

fn generous() -> GlobalStateThatImpactsTilePriority {
    GlobalStateThatImpactsTilePriority::allow_anything(256 * MIB, 1000)
}

/// Room for exactly one of the largest tiles.
fn one_tile_budget(trees: &LayerTrees, tree_priority: TreePriority) -> GlobalStateThatImpactsTilePriority {
    let largest = trees
        .tile_store()
        .iter()
        .map(|(_, tile)| ResourceFormat::Rgba8888.memory_size_bytes(tile.desired_texture_size()))
        .max()
        .expect("tiles");
    GlobalStateThatImpactsTilePriority {
        tree_priority,
        ..GlobalStateThatImpactsTilePriority::allow_anything(largest, 1)
    }
}

fn run_until_idle(manager: &mut TileManager, trees: &mut LayerTrees) {
    for _ in 0..1000 {
        if !manager.has_scheduled_tasks() {
            return;
        }
        manager
            .wait_for_tasks(trees, Duration::from_secs(10))
            .expect("completions");
    }
    panic!("raster work never finished");
}

fn count_tiles(trees: &LayerTrees, predicate: impl Fn(DrawMode) -> bool) -> usize {
    trees
        .tile_store()
        .iter()
        .filter(|(_, tile)| predicate(tile.draw_info().mode()))
        .count()
}

fn has_resource(mode: DrawMode) -> bool {
    matches!(mode, DrawMode::Resource(Some(_)))
}

fn ready(mode: DrawMode) -> bool {
    !matches!(mode, DrawMode::Resource(None))
}

#[test]
fn visible_tiles_are_rastered_and_activation_is_signaled() {
    init_logging();
    let mut trees = pending_trees(1000);
    let (mut manager, gpu) = manager(TileManagerSettings::default());

    assert!(manager.prepare_tiles(&mut trees, generous()).expect("prepare"));
    assert!(manager.has_scheduled_tasks());
    run_until_idle(&mut manager, &mut trees);

    let tiles = trees.tile_store().len();
    let rastered = count_tiles(&trees, has_resource);
    assert!(rastered > 0);
    assert_eq!(count_tiles(&trees, ready), tiles);
    assert_eq!(count_tiles(&trees, |mode| mode == DrawMode::OutOfMemory), 0);
    assert!(manager.is_ready_to_activate(&trees));
    assert!(manager.all_tiles_that_need_to_be_rasterized_are_scheduled());

    let notifications = manager.take_notifications();
    assert!(notifications.contains(&TileManagerNotification::ReadyToActivate));
    assert_eq!(
        notifications.last(),
        Some(&TileManagerNotification::AllTileTasksCompleted)
    );
    let changed = notifications
        .iter()
        .filter(|notification| matches!(notification, TileManagerNotification::TileStateChanged(_)))
        .count();
    assert_eq!(changed, tiles);

    let stats = manager.memory_stats();
    assert_eq!(stats.resources_in_use, rastered);
    assert!(stats.had_enough_memory_to_schedule_tiles_needed_now);
    assert_eq!(
        gpu.count_commands(|command| matches!(command, GpuCommand::CreateTexture { .. })),
        rastered
    );
}

#[test]
fn allow_nothing_schedules_nothing_and_marks_nothing() {
    init_logging();
    let mut trees = pending_trees(500);
    let (mut manager, _gpu) = manager(TileManagerSettings::default());
    let state = GlobalStateThatImpactsTilePriority {
        memory_limit_policy: MemoryLimitPolicy::AllowNothing,
        ..generous()
    };

    assert!(!manager.prepare_tiles(&mut trees, state).expect("prepare"));
    assert!(!manager.has_scheduled_tasks());
    assert_eq!(count_tiles(&trees, |mode| mode == DrawMode::OutOfMemory), 0);
    assert_eq!(count_tiles(&trees, has_resource), 0);
    assert!(!manager.is_ready_to_activate(&trees));

    let notifications = manager.take_notifications();
    assert!(!notifications.contains(&TileManagerNotification::ReadyToActivate));
    assert!(notifications.contains(&TileManagerNotification::AllTileTasksCompleted));
}

#[test]
fn tiny_budget_marks_required_tiles_out_of_memory() {
    init_logging();
    let mut trees = pending_trees(1000);
    let (mut manager, _gpu) = manager(TileManagerSettings::default());
    let state = one_tile_budget(&trees, TreePriority::SamePriorityForBothTrees);

    assert!(manager.prepare_tiles(&mut trees, state).expect("prepare"));
    assert_eq!(manager.num_scheduled_tasks(), 1);
    run_until_idle(&mut manager, &mut trees);

    assert_eq!(count_tiles(&trees, has_resource), 1);
    assert!(count_tiles(&trees, |mode| mode == DrawMode::OutOfMemory) > 0);
    assert!(manager.is_ready_to_activate(&trees));
    assert!(!manager.memory_stats().had_enough_memory_to_schedule_tiles_needed_now);
    assert!(manager.memory_stats().bytes_in_use <= state.hard_memory_limit_in_bytes);
    assert!(
        manager
            .take_notifications()
            .contains(&TileManagerNotification::ReadyToActivate)
    );
}

#[test]
fn smoothness_mode_waits_instead_of_marking_out_of_memory() {
    init_logging();
    let mut trees = pending_trees(1000);
    let (mut manager, _gpu) = manager(TileManagerSettings::default());
    let state = one_tile_budget(&trees, TreePriority::SmoothnessTakesPriority);

    manager.prepare_tiles(&mut trees, state).expect("prepare");
    run_until_idle(&mut manager, &mut trees);

    assert_eq!(count_tiles(&trees, |mode| mode == DrawMode::OutOfMemory), 0);
    assert!(!manager.is_ready_to_activate(&trees));
    let notifications = manager.take_notifications();
    assert!(!notifications.contains(&TileManagerNotification::ReadyToActivate));
    assert!(notifications.contains(&TileManagerNotification::AllTileTasksCompleted));
}

#[test]
fn task_limit_caps_each_pass_and_the_rest_follows() {
    init_logging();
    let mut trees = pending_trees(1000);
    let settings = TileManagerSettings {
        scheduled_raster_task_limit: 3,
        ..TileManagerSettings::default()
    };
    let (mut manager, _gpu) = manager(settings);

    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    assert_eq!(manager.num_scheduled_tasks(), 3);
    assert!(!manager.all_tiles_that_need_to_be_rasterized_are_scheduled());

    run_until_idle(&mut manager, &mut trees);
    assert_eq!(count_tiles(&trees, ready), trees.tile_store().len());
    assert_eq!(count_tiles(&trees, |mode| mode == DrawMode::OutOfMemory), 0);
    assert!(manager.is_ready_to_activate(&trees));
}

#[test]
fn lowering_the_budget_evicts_down_to_the_hard_limit() {
    init_logging();
    let mut trees = active_trees(1000);
    let (mut manager, _gpu) = manager(bitmap_settings());
    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    run_until_idle(&mut manager, &mut trees);
    let rastered = count_tiles(&trees, has_resource);
    assert!(rastered > 4);
    manager.take_notifications();

    let state = GlobalStateThatImpactsTilePriority::allow_anything(4 * 256 * 256 * 4, 4);
    manager.prepare_tiles(&mut trees, state).expect("prepare");
    run_until_idle(&mut manager, &mut trees);

    let kept = count_tiles(&trees, has_resource);
    assert!(kept <= 4 && kept < rastered);
    assert!(manager.memory_stats().bytes_in_use <= state.hard_memory_limit_in_bytes);
    assert!(manager.memory_stats().total_resources <= 4);
    assert!(manager.is_ready_to_draw(&trees));
    assert!(
        manager
            .take_notifications()
            .iter()
            .any(|notification| matches!(notification, TileManagerNotification::TileStateChanged(_)))
    );
}

#[test]
fn released_tiles_return_resources_for_reuse() {
    init_logging();
    let mut trees = active_trees(500);
    let (mut manager, gpu) = manager(bitmap_settings());
    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    run_until_idle(&mut manager, &mut trees);
    let rastered = count_tiles(&trees, has_resource);
    let created = gpu.count_commands(|command| matches!(command, GpuCommand::CreateTexture { .. }));
    assert!(rastered > 0);
    assert_eq!(created, rastered);

    trees.commit_to_active_tree(Vec::new());
    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    assert_eq!(trees.tile_store().len(), 0);
    let stats = manager.memory_stats();
    assert_eq!(stats.resources_in_use, 0);
    assert_eq!(stats.total_resources, rastered);

    trees.commit_to_active_tree(vec![layer_update(1, LayerSize::new(500, 500), full(500))]);
    trees.update_tile_priorities(2.0);
    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    run_until_idle(&mut manager, &mut trees);
    assert_eq!(count_tiles(&trees, has_resource), rastered);
    assert_eq!(
        gpu.count_commands(|command| matches!(command, GpuCommand::CreateTexture { .. })),
        created
    );
}

#[test]
fn partial_raster_repaints_only_the_invalidated_rect() {
    init_logging();
    let mut trees = active_trees(500);
    let settings = TileManagerSettings {
        use_partial_raster: true,
        ..bitmap_settings()
    };
    let (mut manager, _gpu) = manager(settings);
    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    run_until_idle(&mut manager, &mut trees);

    let origin_tile = |trees: &LayerTrees| {
        trees
            .tile_store()
            .iter()
            .find(|(_, tile)| tile.tiling_i_index() == 0 && tile.tiling_j_index() == 0)
            .map(|(key, tile)| (key, tile.draw_info().resource()))
            .expect("origin tile")
    };
    let (old_key, old_resource) = origin_tile(&trees);
    let old_resource = old_resource.expect("rastered origin tile");

    let green = Rgba8::new(0, 200, 0, 255);
    let mut update = layer_update(1, LayerSize::new(500, 500), full(500));
    update.raster_source = RasterSourceBuilder::new(LayerSize::new(500, 500))
        .fill_rect(full(500), green)
        .fill_rect(rect(100, 100, 50, 50), Rgba8::new(0, 0, 200, 255))
        .build();
    update.invalidation = Region::from_rect(rect(10, 10, 20, 20));
    trees.commit_to_active_tree(vec![update]);
    trees.update_tile_priorities(2.0);

    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    run_until_idle(&mut manager, &mut trees);

    let (new_key, new_resource) = origin_tile(&trees);
    assert_ne!(new_key, old_key);
    let new_resource = new_resource.expect("rastered replacement tile");
    assert_eq!(new_resource, old_resource);

    let resource = manager
        .resource_pool()
        .resource(new_resource)
        .expect("pooled resource");
    let handle = resource.handle();
    let pixels = handle.pixels.lock();
    let stride = handle.size.width as usize * 4;
    let pixel = |x: usize, y: usize| decode_pixel(ResourceFormat::Rgba8888, &pixels[y * stride + x * 4..]);
    assert_eq!(pixel(15, 15), green);
    assert_eq!(pixel(5, 5), Rgba8::new(200, 30, 30, 255));
}

#[test]
fn lost_context_blocks_prepare_until_recreated() {
    init_logging();
    let mut trees = active_trees(500);
    let (mut manager, gpu) = manager(TileManagerSettings::default());
    gpu.lose_context();

    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    run_until_idle(&mut manager, &mut trees);
    assert!(manager.is_context_lost());
    assert!(
        manager
            .take_notifications()
            .contains(&TileManagerNotification::AllTileTasksCompleted)
    );
    assert!(matches!(
        manager.prepare_tiles(&mut trees, generous()),
        Err(TileManagerError::ContextLost)
    ));

    let fresh = Arc::new(RecordingGpu::new(2));
    manager
        .recreate_context(&mut trees, fresh.clone())
        .expect("recreate");
    assert!(!manager.is_context_lost());
    assert_eq!(count_tiles(&trees, has_resource), 0);
    assert_eq!(manager.memory_stats().total_resources, 0);

    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    run_until_idle(&mut manager, &mut trees);
    assert_eq!(count_tiles(&trees, ready), trees.tile_store().len());
    assert_eq!(fresh.live_textures(), count_tiles(&trees, has_resource));
}

#[test]
fn zero_threads_is_rejected() {
    let settings = TileManagerSettings {
        num_raster_threads: 0,
        ..TileManagerSettings::default()
    };
    let result = TileManager::new(settings, Arc::new(RecordingGpu::default()));
    assert!(matches!(result, Err(TileManagerError::InvalidSettings(_))));
}

#[test]
fn as_value_reports_memory_and_tasks() {
    init_logging();
    let mut trees = pending_trees(500);
    let (mut manager, _gpu) = manager(TileManagerSettings::default());
    manager.prepare_tiles(&mut trees, generous()).expect("prepare");
    run_until_idle(&mut manager, &mut trees);

    let value = manager.as_value();
    assert_eq!(value["scheduled_tasks"], 0);
    assert_eq!(value["context_lost"], false);
    assert_eq!(
        value["memory"]["resources_in_use"],
        serde_json::json!(count_tiles(&trees, has_resource))
    );
}
