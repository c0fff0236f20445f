use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::binary_heap::PeekMut;

use raster_protocol::{PriorityBin, TileResolution, TreePriority, WhichTree};
use smallvec::SmallVec;
use tiling_data::geometry::{ContentRect, IntRectExt};
use tiling_data::{
    DifferenceIterator, ReverseSpiralDifferenceIterator, SpiralDifferenceIterator, TileIndex,
    TileIterator,
};

use crate::prioritized_tile::PrioritizedTile;
use crate::tile::TileStore;
use crate::tiling::{PictureLayerTiling, PriorityRectType, TilingClient};
use crate::tiling_set::LayerTilings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterQueueType {
    All,
    RequiredForActivation,
    RequiredForDraw,
}

/// Index walk for one priority-rect phase of a tiling.
#[derive(Debug)]
pub(crate) enum IndexWalk {
    Rect(TileIterator),
    Difference(DifferenceIterator),
    Spiral(SpiralDifferenceIterator),
    ReverseSpiral(ReverseSpiralDifferenceIterator),
    Done,
}

impl Iterator for IndexWalk {
    type Item = TileIndex;

    fn next(&mut self) -> Option<TileIndex> {
        match self {
            IndexWalk::Rect(walk) => walk.next(),
            IndexWalk::Difference(walk) => walk.next(),
            IndexWalk::Spiral(walk) => walk.next(),
            IndexWalk::ReverseSpiral(walk) => walk.next(),
            IndexWalk::Done => None,
        }
    }
}

/// Walks one tiling from the visible rect outwards, yielding tiles that
/// still need raster.
#[derive(Debug)]
struct TilingRasterIterator<'a> {
    tiling: &'a PictureLayerTiling,
    client: TilingClient<'a>,
    store: &'a TileStore,
    phase: PriorityRectType,
    walk: IndexWalk,
    pending_visible_rect: ContentRect,
    current: Option<PrioritizedTile>,
}

impl<'a> TilingRasterIterator<'a> {
    fn new(tiling: &'a PictureLayerTiling, client: TilingClient<'a>, store: &'a TileStore) -> Self {
        let has_tiles = tiling.has_tiles();
        let walk = if has_tiles {
            IndexWalk::Rect(TileIterator::new(
                tiling.tiling_data(),
                tiling.current_visible_rect(),
                false,
            ))
        } else {
            IndexWalk::Done
        };
        let mut iterator = Self {
            tiling,
            client,
            store,
            phase: PriorityRectType::Visible,
            walk,
            pending_visible_rect: tiling.pending_visible_rect(&client),
            current: None,
        };
        if has_tiles {
            iterator.advance();
        }
        iterator
    }

    fn current(&self) -> Option<&PrioritizedTile> {
        self.current.as_ref()
    }

    fn advance(&mut self) {
        loop {
            while let Some(index) = self.walk.next() {
                if let Some(tile) = self.tile_if_valid(index) {
                    self.current = Some(tile);
                    return;
                }
            }
            if !self.enter_next_phase() {
                self.current = None;
                return;
            }
        }
    }

    fn enter_next_phase(&mut self) -> bool {
        let tiling = self.tiling;
        let data = tiling.tiling_data();
        let visible = tiling.current_visible_rect();
        let (phase, walk) = match self.phase {
            PriorityRectType::Visible => (
                PriorityRectType::PendingVisible,
                IndexWalk::Difference(DifferenceIterator::new(data, self.pending_visible_rect, visible)),
            ),
            PriorityRectType::PendingVisible => (
                PriorityRectType::Skewport,
                IndexWalk::Spiral(SpiralDifferenceIterator::new(
                    data,
                    tiling.current_skewport_rect(),
                    visible,
                    visible,
                )),
            ),
            PriorityRectType::Skewport => (
                PriorityRectType::SoonBorder,
                IndexWalk::Spiral(SpiralDifferenceIterator::new(
                    data,
                    tiling.current_soon_border_rect(),
                    tiling.current_skewport_rect(),
                    visible,
                )),
            ),
            PriorityRectType::SoonBorder => (
                PriorityRectType::Eventually,
                IndexWalk::Spiral(SpiralDifferenceIterator::new(
                    data,
                    tiling.current_eventually_rect(),
                    tiling.current_soon_border_rect(),
                    visible,
                )),
            ),
            PriorityRectType::Eventually => return false,
        };
        self.phase = phase;
        self.walk = walk;
        true
    }

    fn tile_if_valid(&self, index: TileIndex) -> Option<PrioritizedTile> {
        let key = self.tiling.tile_at(index)?;
        let tile = self.store.tile(key);
        if !tile.draw_info().needs_raster() || self.tiling.is_tile_occluded(tile, &self.client) {
            return None;
        }
        // Pending-visible tiles were already produced by their own phase.
        if self.phase > PriorityRectType::PendingVisible {
            let bounds = self.tiling.tiling_data().tile_bounds(index.i, index.j);
            if self.pending_visible_rect.intersects_rect(&bounds) {
                return None;
            }
        }
        Some(
            self.tiling
                .make_prioritized_tile(key, self.phase, self.store, &self.client),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IteratorKind {
    LowRes = 0,
    HighRes = 1,
    ActiveNonIdealPendingHighRes = 2,
}

#[derive(Debug, Clone, Copy)]
struct IterationStage {
    kind: IteratorKind,
    bin: PriorityBin,
}

/// Raster order for one layer: each stage drains one tiling while its tiles
/// stay in the stage's bin.
#[derive(Debug)]
struct TilingSetRasterQueueAll<'a> {
    iterators: [Option<TilingRasterIterator<'a>>; 3],
    stages: SmallVec<[IterationStage; 6]>,
    current_stage: usize,
}

impl<'a> TilingSetRasterQueueAll<'a> {
    fn new(layer: &LayerTilings<'a>, store: &'a TileStore, prioritize_low_res: bool) -> Self {
        let set = layer.tilings;
        let mut high_res = None;
        let mut low_res = None;
        let mut active_non_ideal_pending_high_res = None;
        for tiling in set.tilings() {
            let client = layer.context.client_for(tiling.contents_scale());
            match tiling.resolution() {
                TileResolution::HighResolution => high_res = Some((tiling, client)),
                TileResolution::LowResolution => low_res = Some((tiling, client)),
                TileResolution::NonIdealResolution => {
                    let twin_is_high_res = client
                        .twin
                        .is_some_and(|twin| twin.resolution() == TileResolution::HighResolution);
                    if set.tree() == WhichTree::Active && twin_is_high_res {
                        active_non_ideal_pending_high_res = Some((tiling, client));
                    }
                }
            }
        }

        let use_low_res = low_res.is_some_and(|(tiling, _)| tiling.has_tiles())
            && !layer.context.requires_high_res_to_draw;
        let mut stages = SmallVec::new();
        let mut stage = |kind, bin| stages.push(IterationStage { kind, bin });
        if use_low_res && prioritize_low_res {
            stage(IteratorKind::LowRes, PriorityBin::Now);
        }
        if high_res.is_some() {
            stage(IteratorKind::HighRes, PriorityBin::Now);
        }
        if use_low_res && !prioritize_low_res {
            stage(IteratorKind::LowRes, PriorityBin::Now);
        }
        if active_non_ideal_pending_high_res.is_some() {
            stage(IteratorKind::ActiveNonIdealPendingHighRes, PriorityBin::Now);
            stage(IteratorKind::ActiveNonIdealPendingHighRes, PriorityBin::Soon);
        }
        if high_res.is_some() {
            stage(IteratorKind::HighRes, PriorityBin::Soon);
            stage(IteratorKind::HighRes, PriorityBin::Eventually);
        }

        let make = |entry: Option<(&'a PictureLayerTiling, TilingClient<'a>)>| {
            entry.map(|(tiling, client)| TilingRasterIterator::new(tiling, client, store))
        };
        let mut queue = Self {
            iterators: [
                if use_low_res { make(low_res) } else { None },
                make(high_res),
                make(active_non_ideal_pending_high_res),
            ],
            stages,
            current_stage: 0,
        };
        queue.skip_to_valid_stage();
        queue
    }

    fn is_empty(&self) -> bool {
        self.current_stage >= self.stages.len()
    }

    fn stage_tile(&self, stage: IterationStage) -> Option<&PrioritizedTile> {
        self.iterators[stage.kind as usize]
            .as_ref()
            .and_then(TilingRasterIterator::current)
    }

    fn top(&self) -> &PrioritizedTile {
        let stage = self.stages[self.current_stage];
        self.stage_tile(stage)
            .unwrap_or_else(|| panic!("raster stage {:?} has no tile", stage.kind))
    }

    fn pop(&mut self) {
        let stage = self.stages[self.current_stage];
        if let Some(iterator) = self.iterators[stage.kind as usize].as_mut() {
            iterator.advance();
        }
        self.skip_to_valid_stage();
    }

    fn skip_to_valid_stage(&mut self) {
        while self.current_stage < self.stages.len() {
            let stage = self.stages[self.current_stage];
            if self
                .stage_tile(stage)
                .is_some_and(|tile| tile.priority.priority_bin == stage.bin)
            {
                return;
            }
            self.current_stage += 1;
        }
    }
}

/// Whether `a` rasters strictly after `b`.
fn raster_lower_priority(a: &PrioritizedTile, b: &PrioritizedTile, tree_priority: TreePriority) -> bool {
    let (a, b) = (&a.priority, &b.priority);
    if a.priority_bin == b.priority_bin && a.resolution != b.resolution {
        if a.resolution == TileResolution::NonIdealResolution {
            return true;
        }
        if b.resolution == TileResolution::NonIdealResolution {
            return false;
        }
        return if tree_priority == TreePriority::SmoothnessTakesPriority {
            b.resolution == TileResolution::LowResolution
        } else {
            b.resolution == TileResolution::HighResolution
        };
    }
    b.is_higher_priority_than(a)
}

#[derive(Debug)]
struct RasterOrdered<'a> {
    queue: TilingSetRasterQueueAll<'a>,
    tree_priority: TreePriority,
}

impl Ord for RasterOrdered<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.queue.top(), other.queue.top());
        if raster_lower_priority(a, b, self.tree_priority) {
            Ordering::Less
        } else if raster_lower_priority(b, a, self.tree_priority) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl PartialOrd for RasterOrdered<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RasterOrdered<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RasterOrdered<'_> {}

/// Every layer of both trees, merged in raster order.
#[derive(Debug)]
pub struct RasterQueueAll<'a> {
    active: BinaryHeap<RasterOrdered<'a>>,
    pending: BinaryHeap<RasterOrdered<'a>>,
    tree_priority: TreePriority,
}

impl<'a> RasterQueueAll<'a> {
    fn new(
        active_layers: &[LayerTilings<'a>],
        pending_layers: &[LayerTilings<'a>],
        store: &'a TileStore,
        tree_priority: TreePriority,
    ) -> Self {
        let prioritize_low_res = tree_priority == TreePriority::SmoothnessTakesPriority;
        let heap = |layers: &[LayerTilings<'a>]| {
            layers
                .iter()
                .filter(|layer| layer.context.has_valid_tile_priorities)
                .map(|layer| TilingSetRasterQueueAll::new(layer, store, prioritize_low_res))
                .filter(|queue| !queue.is_empty())
                .map(|queue| RasterOrdered {
                    queue,
                    tree_priority,
                })
                .collect::<BinaryHeap<_>>()
        };
        Self {
            active: heap(active_layers),
            pending: heap(pending_layers),
            tree_priority,
        }
    }

    fn next_tree(&self) -> Option<WhichTree> {
        let active = self.active.peek().map(|entry| entry.queue.top());
        let pending = self.pending.peek().map(|entry| entry.queue.top());
        let (active, pending) = match (active, pending) {
            (None, None) => return None,
            (Some(_), None) => return Some(WhichTree::Active),
            (None, Some(_)) => return Some(WhichTree::Pending),
            (Some(active), Some(pending)) => (active, pending),
        };
        let tree = match self.tree_priority {
            TreePriority::SmoothnessTakesPriority => {
                // Down to prepaint on the active tree: let activation proceed.
                if active.priority.priority_bin == PriorityBin::Eventually
                    && pending.priority.required_for_activation
                {
                    WhichTree::Pending
                } else {
                    WhichTree::Active
                }
            }
            TreePriority::NewContentTakesPriority => {
                if pending.priority.priority_bin >= PriorityBin::Soon
                    && active.priority.required_for_activation
                {
                    WhichTree::Active
                } else {
                    WhichTree::Pending
                }
            }
            TreePriority::SamePriorityForBothTrees => {
                if active.priority.is_higher_priority_than(&pending.priority) {
                    WhichTree::Active
                } else {
                    WhichTree::Pending
                }
            }
        };
        Some(tree)
    }

    fn heap_mut(&mut self, tree: WhichTree) -> &mut BinaryHeap<RasterOrdered<'a>> {
        match tree {
            WhichTree::Active => &mut self.active,
            WhichTree::Pending => &mut self.pending,
        }
    }

    fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }

    fn top(&self) -> &PrioritizedTile {
        let heap = match self.next_tree() {
            Some(WhichTree::Active) => &self.active,
            Some(WhichTree::Pending) => &self.pending,
            None => panic!("top() on an empty raster queue"),
        };
        heap.peek()
            .map(|entry| entry.queue.top())
            .unwrap_or_else(|| panic!("raster heap emptied while choosing a tree"))
    }

    fn pop(&mut self) {
        let tree = self
            .next_tree()
            .unwrap_or_else(|| panic!("pop() on an empty raster queue"));
        if let Some(mut entry) = self.heap_mut(tree).peek_mut() {
            entry.queue.pop();
            if entry.queue.is_empty() {
                PeekMut::pop(entry);
            }
        }
    }
}

/// Visible tiles of the high-res tiling that gate activation or draw.
#[derive(Debug)]
struct TilingSetRasterQueueRequired<'a> {
    tiling: &'a PictureLayerTiling,
    client: TilingClient<'a>,
    store: &'a TileStore,
    queue_type: RasterQueueType,
    walk: TileIterator,
    current: Option<PrioritizedTile>,
}

impl<'a> TilingSetRasterQueueRequired<'a> {
    fn new(layer: &LayerTilings<'a>, store: &'a TileStore, queue_type: RasterQueueType) -> Option<Self> {
        let set = layer.tilings;
        let activation_on_active_tree =
            queue_type == RasterQueueType::RequiredForActivation && set.tree() == WhichTree::Active;

        // On the active tree, activation only waits on tiles shared with the
        // pending high-res tiling.
        let (tiling, client) = if activation_on_active_tree {
            set.tilings().iter().find_map(|tiling| {
                let client = layer.context.client_for(tiling.contents_scale());
                client
                    .twin
                    .is_some_and(|twin| twin.resolution() == TileResolution::HighResolution)
                    .then_some((tiling, client))
            })?
        } else {
            let tiling = set.find_tiling_with_resolution(TileResolution::HighResolution)?;
            (tiling, layer.context.client_for(tiling.contents_scale()))
        };

        let rect = if activation_on_active_tree {
            tiling.pending_visible_rect(&client)
        } else {
            tiling.current_visible_rect()
        };
        let mut queue = Self {
            tiling,
            client,
            store,
            queue_type,
            walk: TileIterator::new(tiling.tiling_data(), rect, false),
            current: None,
        };
        queue.advance();
        queue.current.is_some().then_some(queue)
    }

    fn advance(&mut self) {
        while let Some(index) = self.walk.next() {
            if let Some(tile) = self.tile_if_required(index) {
                self.current = Some(tile);
                return;
            }
        }
        self.current = None;
    }

    fn tile_if_required(&self, index: TileIndex) -> Option<PrioritizedTile> {
        let key = self.tiling.tile_at(index)?;
        let tile = self.store.tile(key);
        if !tile.draw_info().needs_raster() || self.tiling.is_tile_occluded(tile, &self.client) {
            return None;
        }
        let rect_type = self.tiling.compute_priority_rect_type_for_tile(tile, &self.client);
        let prioritized = self
            .tiling
            .make_prioritized_tile(key, rect_type, self.store, &self.client);
        let required = match self.queue_type {
            RasterQueueType::RequiredForActivation => prioritized.priority.required_for_activation,
            RasterQueueType::RequiredForDraw => prioritized.required_for_draw,
            RasterQueueType::All => true,
        };
        required.then_some(prioritized)
    }
}

/// Stack of per-layer required queues, drained one layer at a time.
#[derive(Debug)]
pub struct RasterQueueRequired<'a> {
    queues: Vec<TilingSetRasterQueueRequired<'a>>,
}

impl<'a> RasterQueueRequired<'a> {
    fn new(
        active_layers: &[LayerTilings<'a>],
        pending_layers: &[LayerTilings<'a>],
        store: &'a TileStore,
        queue_type: RasterQueueType,
    ) -> Self {
        let mut queues: Vec<_> = active_layers
            .iter()
            .filter_map(|layer| TilingSetRasterQueueRequired::new(layer, store, queue_type))
            .collect();
        if queue_type == RasterQueueType::RequiredForActivation {
            queues.extend(
                pending_layers
                    .iter()
                    .filter_map(|layer| TilingSetRasterQueueRequired::new(layer, store, queue_type)),
            );
        }
        Self { queues }
    }

    fn top(&self) -> &PrioritizedTile {
        self.queues
            .last()
            .and_then(|queue| queue.current.as_ref())
            .unwrap_or_else(|| panic!("top() on an empty required raster queue"))
    }

    fn pop(&mut self) {
        let Some(queue) = self.queues.last_mut() else {
            panic!("pop() on an empty required raster queue");
        };
        queue.advance();
        if queue.current.is_none() {
            self.queues.pop();
        }
    }
}

/// Tiles that need raster, most urgent first.
#[derive(Debug)]
pub enum RasterTilePriorityQueue<'a> {
    All(RasterQueueAll<'a>),
    Required(RasterQueueRequired<'a>),
}

impl<'a> RasterTilePriorityQueue<'a> {
    pub fn build(
        active_layers: &[LayerTilings<'a>],
        pending_layers: &[LayerTilings<'a>],
        store: &'a TileStore,
        tree_priority: TreePriority,
        queue_type: RasterQueueType,
    ) -> Self {
        match queue_type {
            RasterQueueType::All => RasterTilePriorityQueue::All(RasterQueueAll::new(
                active_layers,
                pending_layers,
                store,
                tree_priority,
            )),
            RasterQueueType::RequiredForActivation | RasterQueueType::RequiredForDraw => {
                RasterTilePriorityQueue::Required(RasterQueueRequired::new(
                    active_layers,
                    pending_layers,
                    store,
                    queue_type,
                ))
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RasterTilePriorityQueue::All(queue) => queue.is_empty(),
            RasterTilePriorityQueue::Required(queue) => queue.queues.is_empty(),
        }
    }

    pub fn top(&self) -> &PrioritizedTile {
        match self {
            RasterTilePriorityQueue::All(queue) => queue.top(),
            RasterTilePriorityQueue::Required(queue) => queue.top(),
        }
    }

    pub fn pop(&mut self) {
        match self {
            RasterTilePriorityQueue::All(queue) => queue.pop(),
            RasterTilePriorityQueue::Required(queue) => queue.pop(),
        }
    }
}

impl Iterator for RasterTilePriorityQueue<'_> {
    type Item = PrioritizedTile;

    fn next(&mut self) -> Option<PrioritizedTile> {
        if self.is_empty() {
            return None;
        }
        let tile = self.top().clone();
        self.pop();
        Some(tile)
    }
}
