use std::collections::HashSet;

use raster_protocol::{
    ContentId, LayerId, Occlusion, PriorityBin, ResourceId, TileResolution, TreePriority, WhichTree,
};
use tiling_data::geometry::{IntRectExt, LayerRect, LayerSize, rect};
use tiling_data::{Region, TileIndex};

use crate::test_helpers::{fixed_tile_settings, layer_update};
use crate::{LayerTrees, LayerUpdate, PictureLayerTiling, RasterQueueType, TilingSettings};

const LAYER: LayerId = LayerId(1);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn full(size: i32) -> LayerRect {
    rect(0, 0, size, size)
}

fn committed(settings: TilingSettings, update: LayerUpdate) -> LayerTrees {
    let mut trees = LayerTrees::new(settings);
    trees.commit(vec![update]);
    trees.update_tile_priorities(1.0);
    trees
}

fn activated(settings: TilingSettings, update: LayerUpdate) -> LayerTrees {
    let mut trees = committed(settings, update);
    trees.activate();
    trees.update_tile_priorities(2.0);
    trees
}

fn high_res_tiling(trees: &LayerTrees, which: WhichTree) -> &PictureLayerTiling {
    trees
        .layer(which, LAYER)
        .and_then(|layer| {
            layer
                .tilings()
                .find_tiling_with_resolution(TileResolution::HighResolution)
        })
        .unwrap_or_else(|| panic!("no high-res tiling on {which:?}"))
}

fn give_every_tile_a_resource(trees: &mut LayerTrees) {
    let store = trees.tile_store_mut();
    let keys: Vec<_> = store.iter().map(|(key, _)| key).collect();
    for (slot, key) in keys.into_iter().enumerate() {
        if let Some(tile) = store.get_mut(key) {
            tile.draw_info_mut().set_resource(ResourceId {
                slot: slot as u32,
                generation: 0,
            });
        }
    }
}

#[test]
fn full_viewport_on_1000_square_layer_rasters_16_tiles() {
    init_logging();
    let trees = committed(
        TilingSettings::default(),
        layer_update(1, LayerSize::new(1000, 1000), full(1000)),
    );

    let queue = trees.build_raster_queue(TreePriority::SamePriorityForBothTrees, RasterQueueType::All);
    let tiles: Vec<_> = queue.collect();
    assert_eq!(tiles.len(), 16);
    let unique: HashSet<_> = tiles.iter().map(|tile| tile.tile).collect();
    assert_eq!(unique.len(), 16);
    assert!(tiles.iter().all(|tile| tile.priority.priority_bin == PriorityBin::Now));
}

#[test]
fn pending_invalidation_replaces_exactly_one_tile() {
    init_logging();
    let size = LayerSize::new(1000, 1000);
    let mut trees = activated(fixed_tile_settings(), layer_update(1, size, full(1000)));

    let active = high_res_tiling(&trees, WhichTree::Active);
    let target = TileIndex::new(1, 1);
    let active_key = active.tile_at(target).expect("active tile at (1, 1)");
    let active_tile = trees.tile_store().get(active_key).expect("live active tile");
    let active_id = active_tile.id();
    let invalidation: LayerRect = active_tile.content_rect().inset(2, 2, 2, 2).cast_unit();

    let mut update = layer_update(1, size, full(1000));
    update.invalidation = Region::from_rect(invalidation);
    trees.commit(vec![update]);
    trees.update_tile_priorities(3.0);

    let pending = high_res_tiling(&trees, WhichTree::Pending);
    let pending_key = pending.tile_at(target).expect("pending tile at (1, 1)");
    let pending_tile = trees.tile_store().get(pending_key).expect("live pending tile");
    assert_ne!(pending_tile.id(), active_id);
    assert_eq!(pending_tile.invalidated_id(), ContentId::from(active_id));
    for neighbour in [(0, 1), (2, 1), (1, 0), (1, 2)] {
        let index = TileIndex::new(neighbour.0, neighbour.1);
        assert!(pending.tile_at(index).is_none(), "pending tile at {index:?}");
        assert!(
            high_res_tiling(&trees, WhichTree::Active).tile_at(index).is_some(),
            "active tile at {index:?}"
        );
    }
    assert_eq!(pending.num_tiles(), 1);
}

#[test]
fn activation_moves_tiles_without_copying() {
    init_logging();
    let mut trees = committed(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(800, 600), full(800)),
    );
    let mut before: Vec<_> = high_res_tiling(&trees, WhichTree::Pending).tiles().collect();
    before.sort_by_key(|(index, _)| *index);
    let live_tiles = trees.tile_store().len();

    trees.activate();

    let mut after: Vec<_> = high_res_tiling(&trees, WhichTree::Active).tiles().collect();
    after.sort_by_key(|(index, _)| *index);
    assert_eq!(before, after);
    assert_eq!(trees.tile_store().len(), live_tiles);
    assert!(!trees.has_pending_tree());
}

#[test]
fn activation_drops_layers_missing_from_pending_tree() {
    init_logging();
    let mut trees = activated(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(500, 500), full(500)),
    );
    assert!(trees.tile_store().iter().count() > 0);

    trees.commit(vec![layer_update(2, LayerSize::new(300, 300), full(300))]);
    trees.activate();

    assert!(trees.layer(WhichTree::Active, LAYER).is_none());
    assert!(trees.layer(WhichTree::Active, LayerId(2)).is_some());
    assert!(trees.tile_store_mut().take_released().len() >= 4);
}

#[test]
fn raster_queue_bins_never_decrease() {
    init_logging();
    let trees = committed(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(2000, 6000), full(1000)),
    );

    let bins: Vec<PriorityBin> = trees
        .build_raster_queue(TreePriority::SamePriorityForBothTrees, RasterQueueType::All)
        .map(|tile| tile.priority.priority_bin)
        .collect();
    assert!(bins.windows(2).all(|pair| pair[0] <= pair[1]), "{bins:?}");
    for bin in [PriorityBin::Now, PriorityBin::Soon, PriorityBin::Eventually] {
        assert!(bins.contains(&bin), "no {bin:?} tile in {bins:?}");
    }
}

#[test]
fn raster_queue_distance_mostly_increases_within_a_bin() {
    init_logging();
    let trees = committed(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(1000, 6000), rect(0, 2500, 1000, 1000)),
    );

    let eventually: Vec<f32> = trees
        .build_raster_queue(TreePriority::SamePriorityForBothTrees, RasterQueueType::All)
        .filter(|tile| tile.priority.priority_bin == PriorityBin::Eventually)
        .map(|tile| tile.priority.distance_to_visible)
        .collect();
    assert!(eventually.len() > 10);
    let ordered = eventually
        .windows(2)
        .filter(|pair| pair[0] <= pair[1])
        .count();
    assert!(
        ordered * 4 >= (eventually.len() - 1) * 3,
        "only {ordered} of {} steps in order",
        eventually.len() - 1
    );
}

#[test]
fn invisible_layers_are_left_out_of_the_raster_queue() {
    init_logging();
    let mut update = layer_update(1, LayerSize::new(500, 500), full(500));
    update.is_drawn = false;
    let trees = committed(fixed_tile_settings(), update);

    let mut queue = trees.build_raster_queue(TreePriority::SamePriorityForBothTrees, RasterQueueType::All);
    assert!(queue.is_empty());
    assert!(queue.next().is_none());
}

#[test]
fn eviction_starts_far_away_and_keeps_required_tiles_last() {
    init_logging();
    let mut update = layer_update(1, LayerSize::new(2000, 6000), full(1000));
    // Hide the top-left tile so some visible tiles are not required.
    update.occlusion = Occlusion::new(Region::from_rect(rect(0, 0, 300, 300)));
    let mut trees = committed(fixed_tile_settings(), update);
    give_every_tile_a_resource(&mut trees);

    let tiles: Vec<_> = trees
        .build_eviction_queue(TreePriority::SamePriorityForBothTrees)
        .collect();
    assert_eq!(tiles.len(), trees.num_tiles());
    assert_eq!(tiles[0].priority.priority_bin, PriorityBin::Eventually);
    assert!(
        tiles
            .windows(2)
            .all(|pair| pair[0].priority.priority_bin >= pair[1].priority.priority_bin)
    );

    let now: Vec<bool> = tiles
        .iter()
        .filter(|tile| tile.priority.priority_bin == PriorityBin::Now)
        .map(|tile| tile.priority.required_for_activation)
        .collect();
    let first_required = now.iter().position(|required| *required).expect("required tiles");
    assert!(first_required > 0, "occluded tile should go first");
    assert!(now[first_required..].iter().all(|required| *required));
}

#[test]
fn tiles_without_resources_are_not_evicted() {
    init_logging();
    let trees = committed(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(1000, 1000), full(1000)),
    );
    assert!(
        trees
            .build_eviction_queue(TreePriority::SmoothnessTakesPriority)
            .next()
            .is_none()
    );
}

#[test]
fn required_for_activation_covers_pending_visible_tiles() {
    init_logging();
    let mut trees = committed(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(1000, 1000), rect(0, 0, 500, 500)),
    );

    let required: Vec<_> = trees
        .build_raster_queue(
            TreePriority::SamePriorityForBothTrees,
            RasterQueueType::RequiredForActivation,
        )
        .collect();
    assert_eq!(required.len(), 4);
    assert!(required.iter().all(|tile| tile.tree == WhichTree::Pending));
    assert!(required.iter().all(|tile| tile.priority.required_for_activation));

    give_every_tile_a_resource(&mut trees);
    assert!(
        trees
            .build_raster_queue(
                TreePriority::SamePriorityForBothTrees,
                RasterQueueType::RequiredForActivation,
            )
            .is_empty()
    );
}

#[test]
fn required_for_draw_only_looks_at_the_active_tree() {
    init_logging();
    let trees = committed(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(1000, 1000), rect(0, 0, 500, 500)),
    );
    assert!(
        trees
            .build_raster_queue(TreePriority::SamePriorityForBothTrees, RasterQueueType::RequiredForDraw)
            .is_empty()
    );

    let trees = activated(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(1000, 1000), rect(0, 0, 500, 500)),
    );
    let required: Vec<_> = trees
        .build_raster_queue(TreePriority::SamePriorityForBothTrees, RasterQueueType::RequiredForDraw)
        .collect();
    assert_eq!(required.len(), 4);
    assert!(required.iter().all(|tile| tile.required_for_draw));
}

#[test]
fn active_tree_gets_a_low_res_tiling_by_default() {
    init_logging();
    let trees = activated(
        TilingSettings::default(),
        layer_update(1, LayerSize::new(1000, 1000), full(1000)),
    );
    let layer = trees.layer(WhichTree::Active, LAYER).expect("active layer");
    let low_res = layer
        .tilings()
        .find_tiling_with_resolution(TileResolution::LowResolution)
        .expect("low-res tiling");
    assert_eq!(low_res.contents_scale(), 0.25);

    // Smoothness rasters the low-res tile first.
    let first = trees
        .build_raster_queue(TreePriority::SmoothnessTakesPriority, RasterQueueType::All)
        .next()
        .expect("a tile to raster");
    assert_eq!(first.priority.resolution, TileResolution::LowResolution);
    let first = trees
        .build_raster_queue(TreePriority::SamePriorityForBothTrees, RasterQueueType::All)
        .next()
        .expect("a tile to raster");
    assert_eq!(first.priority.resolution, TileResolution::HighResolution);
}

#[test]
fn gpu_rasterization_skips_low_res_tiling() {
    init_logging();
    let mut trees = LayerTrees::new(TilingSettings::default());
    trees.set_gpu_rasterization(Some(tiling_data::geometry::size(1000, 1000)));
    trees.commit(vec![layer_update(1, LayerSize::new(1000, 1000), full(1000))]);
    trees.update_tile_priorities(1.0);
    trees.activate();
    trees.update_tile_priorities(2.0);

    let layer = trees.layer(WhichTree::Active, LAYER).expect("active layer");
    assert!(
        layer
            .tilings()
            .find_tiling_with_resolution(TileResolution::LowResolution)
            .is_none()
    );
}

#[test]
fn scale_change_on_pending_tree_drops_old_tiling() {
    init_logging();
    let mut trees = committed(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(400, 400), full(400)),
    );
    trees.activate();
    trees.update_tile_priorities(2.0);

    let mut update = layer_update(1, LayerSize::new(400, 400), full(400));
    update.ideal_contents_scale = 2.0;
    trees.commit(vec![update]);
    trees.update_tile_priorities(3.0);

    let pending = trees.layer(WhichTree::Pending, LAYER).expect("pending layer");
    let scales: Vec<f32> = pending
        .tilings()
        .tilings()
        .iter()
        .map(PictureLayerTiling::contents_scale)
        .collect();
    assert_eq!(scales, vec![2.0]);

    trees.activate();
    trees.update_tile_priorities(4.0);
    let active = trees.layer(WhichTree::Active, LAYER).expect("active layer");
    assert_eq!(
        active
            .tilings()
            .find_tiling_with_resolution(TileResolution::HighResolution)
            .map(PictureLayerTiling::contents_scale),
        Some(2.0)
    );
    // The scale-1 tiling has no pending twin left and is dropped.
    assert!(active.tilings().find_tiling_with_scale(1.0).is_none());
}

#[test]
#[should_panic(expected = "commit while a pending tree is waiting to activate")]
fn double_commit_panics() {
    let mut trees = LayerTrees::new(fixed_tile_settings());
    trees.commit(vec![layer_update(1, LayerSize::new(100, 100), full(100))]);
    trees.commit(vec![layer_update(1, LayerSize::new(100, 100), full(100))]);
}

#[test]
fn commit_to_active_tree_invalidates_in_place() {
    init_logging();
    let mut trees = LayerTrees::new(fixed_tile_settings());
    trees.commit_to_active_tree(vec![layer_update(1, LayerSize::new(500, 500), full(500))]);
    trees.update_tile_priorities(1.0);
    let before = high_res_tiling(&trees, WhichTree::Active)
        .tile_at(TileIndex::new(0, 0))
        .expect("tile at origin");

    let mut update = layer_update(1, LayerSize::new(500, 500), full(500));
    update.invalidation = Region::from_rect(rect(10, 10, 20, 20));
    trees.commit_to_active_tree(vec![update]);

    let tiling = high_res_tiling(&trees, WhichTree::Active);
    let after = tiling.tile_at(TileIndex::new(0, 0)).expect("recreated tile");
    assert_ne!(before, after);
    let tile = trees.tile_store().get(after).expect("live tile");
    assert_eq!(tile.invalidated_content_rect(), rect(10, 10, 20, 20));
    assert!(tiling.tile_at(TileIndex::new(1, 1)).is_some());
}

#[test]
fn commit_to_active_tree_drops_tiles_whose_border_was_invalidated() {
    init_logging();
    let mut trees = LayerTrees::new(fixed_tile_settings());
    trees.commit_to_active_tree(vec![layer_update(1, LayerSize::new(500, 500), full(500))]);
    trees.update_tile_priorities(1.0);
    let tiling = high_res_tiling(&trees, WhichTree::Active);
    let border_x = tiling.tiling_data().tile_bounds(0, 0).max_x();
    let before = tiling.tile_at(TileIndex::new(0, 0)).expect("tile at origin");

    let mut update = layer_update(1, LayerSize::new(500, 500), full(500));
    update.invalidation = Region::from_rect(rect(border_x, 100, 1, 1));
    trees.commit_to_active_tree(vec![update]);

    let tiling = high_res_tiling(&trees, WhichTree::Active);
    let after = tiling.tile_at(TileIndex::new(0, 0)).expect("recreated tile");
    assert_ne!(before, after);
    let tile = trees.tile_store().get(after).expect("live tile");
    assert_eq!(tile.invalidated_content_rect(), rect(border_x, 100, 1, 1));
}

#[test]
fn as_value_lists_both_trees() {
    let trees = committed(
        fixed_tile_settings(),
        layer_update(1, LayerSize::new(300, 300), full(300)),
    );
    let value = trees.as_value();
    assert_eq!(value["active"].as_array().map(Vec::len), Some(0));
    assert_eq!(value["pending"].as_array().map(Vec::len), Some(1));
    assert_eq!(value["live_tiles"], serde_json::json!(trees.tile_store().len()));
}
