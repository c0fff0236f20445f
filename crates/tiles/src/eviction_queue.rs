use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::binary_heap::PeekMut;

use raster_protocol::{TileResolution, TreePriority, WhichTree};
use tiling_data::geometry::{ContentRect, IntRectExt};
use tiling_data::{DifferenceIterator, ReverseSpiralDifferenceIterator, TileIndex, TileIterator};

use crate::prioritized_tile::PrioritizedTile;
use crate::raster_queue::IndexWalk;
use crate::tile::TileStore;
use crate::tiling::{PictureLayerTiling, PriorityRectType, TilingClient};
use crate::tiling_set::{LayerTilings, TilingRangeType};

/// Eviction phases, least valuable first. The visible rect is split four
/// ways so that tiles the pending tree needs go last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EvictionPhase {
    EventuallyRect,
    SoonBorderRect,
    SkewportRect,
    PendingVisibleRect,
    VisibleRectOccluded,
    VisibleRectUnoccluded,
    VisibleRectRequiredForActivationOccluded,
    VisibleRectRequiredForActivationUnoccluded,
}

impl EvictionPhase {
    const fn next(self) -> Option<Self> {
        Some(match self {
            EvictionPhase::EventuallyRect => EvictionPhase::SoonBorderRect,
            EvictionPhase::SoonBorderRect => EvictionPhase::SkewportRect,
            EvictionPhase::SkewportRect => EvictionPhase::PendingVisibleRect,
            EvictionPhase::PendingVisibleRect => EvictionPhase::VisibleRectOccluded,
            EvictionPhase::VisibleRectOccluded => EvictionPhase::VisibleRectUnoccluded,
            EvictionPhase::VisibleRectUnoccluded => {
                EvictionPhase::VisibleRectRequiredForActivationOccluded
            }
            EvictionPhase::VisibleRectRequiredForActivationOccluded => {
                EvictionPhase::VisibleRectRequiredForActivationUnoccluded
            }
            EvictionPhase::VisibleRectRequiredForActivationUnoccluded => return None,
        })
    }

    const fn rect_type(self) -> PriorityRectType {
        match self {
            EvictionPhase::EventuallyRect => PriorityRectType::Eventually,
            EvictionPhase::SoonBorderRect => PriorityRectType::SoonBorder,
            EvictionPhase::SkewportRect => PriorityRectType::Skewport,
            EvictionPhase::PendingVisibleRect => PriorityRectType::PendingVisible,
            _ => PriorityRectType::Visible,
        }
    }

    /// `(occluded, required_for_activation)` filter of the visible phases.
    const fn visible_flags(self) -> Option<(bool, bool)> {
        match self {
            EvictionPhase::VisibleRectOccluded => Some((true, false)),
            EvictionPhase::VisibleRectUnoccluded => Some((false, false)),
            EvictionPhase::VisibleRectRequiredForActivationOccluded => Some((true, true)),
            EvictionPhase::VisibleRectRequiredForActivationUnoccluded => Some((false, true)),
            _ => None,
        }
    }
}

/// Eviction order for one layer: phase by phase, and within a phase tiling
/// by tiling, ideal tilings last.
#[derive(Debug)]
struct TilingSetEvictionQueue<'a> {
    tilings: Vec<(&'a PictureLayerTiling, TilingClient<'a>)>,
    store: &'a TileStore,
    phase: EvictionPhase,
    tiling_index: usize,
    walk: IndexWalk,
    current: Option<PrioritizedTile>,
}

impl<'a> TilingSetEvictionQueue<'a> {
    fn new(layer: &LayerTilings<'a>, store: &'a TileStore) -> Self {
        let set = layer.tilings;
        let mut order = Vec::with_capacity(set.num_tilings());
        order.extend(set.tiling_range(TilingRangeType::HigherThanHighRes));
        order.extend(set.tiling_range(TilingRangeType::LowerThanLowRes).rev());
        order.extend(set.tiling_range(TilingRangeType::BetweenHighAndLowRes).rev());
        order.extend(set.tiling_range(TilingRangeType::LowRes));
        order.extend(set.tiling_range(TilingRangeType::HighRes));

        let tilings = order
            .into_iter()
            .map(|index| set.tiling_at(index))
            .filter(|tiling| tiling.has_tiles())
            .map(|tiling| (tiling, layer.context.client_for(tiling.contents_scale())))
            .collect();

        let mut queue = Self {
            tilings,
            store,
            phase: EvictionPhase::EventuallyRect,
            tiling_index: 0,
            walk: IndexWalk::Done,
            current: None,
        };
        if !queue.tilings.is_empty() {
            queue.walk = queue.walk_for_current_tiling();
            queue.advance();
        }
        queue
    }

    fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    fn top(&self) -> &PrioritizedTile {
        self.current
            .as_ref()
            .unwrap_or_else(|| panic!("top() on an empty eviction queue"))
    }

    fn walk_for_current_tiling(&self) -> IndexWalk {
        let (tiling, client) = self.tilings[self.tiling_index];
        let data = tiling.tiling_data();
        let visible = tiling.current_visible_rect();
        match self.phase {
            EvictionPhase::EventuallyRect => IndexWalk::ReverseSpiral(ReverseSpiralDifferenceIterator::new(
                data,
                tiling.current_eventually_rect(),
                tiling.current_soon_border_rect(),
                visible,
            )),
            EvictionPhase::SoonBorderRect => IndexWalk::ReverseSpiral(ReverseSpiralDifferenceIterator::new(
                data,
                tiling.current_soon_border_rect(),
                tiling.current_skewport_rect(),
                visible,
            )),
            EvictionPhase::SkewportRect => IndexWalk::ReverseSpiral(ReverseSpiralDifferenceIterator::new(
                data,
                tiling.current_skewport_rect(),
                visible,
                visible,
            )),
            EvictionPhase::PendingVisibleRect => IndexWalk::Difference(DifferenceIterator::new(
                data,
                tiling.pending_visible_rect(&client),
                visible,
            )),
            _ => IndexWalk::Rect(TileIterator::new(data, visible, false)),
        }
    }

    /// Moves to the next tiling, or to the first tiling of the next phase.
    fn next_walk(&mut self) -> bool {
        self.tiling_index += 1;
        if self.tiling_index >= self.tilings.len() {
            let Some(phase) = self.phase.next() else {
                return false;
            };
            self.phase = phase;
            self.tiling_index = 0;
        }
        self.walk = self.walk_for_current_tiling();
        true
    }

    fn advance(&mut self) {
        loop {
            while let Some(index) = self.walk.next() {
                if let Some(tile) = self.tile_if_valid(index) {
                    self.current = Some(tile);
                    return;
                }
            }
            if !self.next_walk() {
                self.current = None;
                return;
            }
        }
    }

    fn pop(&mut self) {
        self.advance();
    }

    fn tile_if_valid(&self, index: TileIndex) -> Option<PrioritizedTile> {
        let (tiling, client) = self.tilings[self.tiling_index];
        let key = tiling.tile_at(index)?;
        let tile = self.store.tile(key);
        if !tile.draw_info().has_resource() {
            return None;
        }
        // Tiles touching the pending visible rect belong to its phase.
        if self.phase < EvictionPhase::PendingVisibleRect {
            let pending_visible: ContentRect = tiling.pending_visible_rect(&client);
            let bounds = tiling.tiling_data().tile_bounds(index.i, index.j);
            if pending_visible.intersects_rect(&bounds) {
                return None;
            }
        }
        let prioritized = tiling.make_prioritized_tile(key, self.phase.rect_type(), self.store, &client);
        if let Some((occluded, required)) = self.phase.visible_flags() {
            if prioritized.is_occluded != occluded
                || prioritized.priority.required_for_activation != required
            {
                return None;
            }
        }
        Some(prioritized)
    }
}

/// Whether `b` should be evicted strictly before `a`.
fn evicted_first(a: &PrioritizedTile, b: &PrioritizedTile, prioritize_low_res: bool) -> bool {
    let (a_priority, b_priority) = (&a.priority, &b.priority);
    if a_priority.priority_bin != b_priority.priority_bin {
        return b_priority.priority_bin > a_priority.priority_bin;
    }
    if a_priority.resolution != b_priority.resolution {
        if a_priority.resolution == TileResolution::NonIdealResolution {
            return false;
        }
        if b_priority.resolution == TileResolution::NonIdealResolution {
            return true;
        }
        return if prioritize_low_res {
            a_priority.resolution == TileResolution::LowResolution
        } else {
            a_priority.resolution == TileResolution::HighResolution
        };
    }
    if a.is_occluded != b.is_occluded {
        return b.is_occluded;
    }
    b_priority.distance_to_visible > a_priority.distance_to_visible
}

#[derive(Debug)]
struct EvictionOrdered<'a> {
    queue: TilingSetEvictionQueue<'a>,
    prioritize_low_res: bool,
}

impl Ord for EvictionOrdered<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.queue.top(), other.queue.top());
        if evicted_first(a, b, self.prioritize_low_res) {
            Ordering::Less
        } else if evicted_first(b, a, self.prioritize_low_res) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl PartialOrd for EvictionOrdered<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for EvictionOrdered<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionOrdered<'_> {}

/// Tiles holding resources, least valuable first.
#[derive(Debug)]
pub struct EvictionTilePriorityQueue<'a> {
    active: BinaryHeap<EvictionOrdered<'a>>,
    pending: BinaryHeap<EvictionOrdered<'a>>,
}

impl<'a> EvictionTilePriorityQueue<'a> {
    pub fn build(
        active_layers: &[LayerTilings<'a>],
        pending_layers: &[LayerTilings<'a>],
        store: &'a TileStore,
        tree_priority: TreePriority,
    ) -> Self {
        let prioritize_low_res = tree_priority == TreePriority::SmoothnessTakesPriority;
        let heap = |layers: &[LayerTilings<'a>]| {
            layers
                .iter()
                .map(|layer| TilingSetEvictionQueue::new(layer, store))
                .filter(|queue| !queue.is_empty())
                .map(|queue| EvictionOrdered {
                    queue,
                    prioritize_low_res,
                })
                .collect::<BinaryHeap<_>>()
        };
        Self {
            active: heap(active_layers),
            pending: heap(pending_layers),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
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
        let active_required = active.priority.required_for_activation;
        if active.priority.priority_bin == pending.priority.priority_bin
            && active_required != pending.priority.required_for_activation
        {
            return Some(if active_required {
                WhichTree::Pending
            } else {
                WhichTree::Active
            });
        }
        if pending.priority.is_higher_priority_than(&active.priority) {
            Some(WhichTree::Active)
        } else {
            Some(WhichTree::Pending)
        }
    }

    pub fn top(&self) -> &PrioritizedTile {
        let heap = match self.next_tree() {
            Some(WhichTree::Active) => &self.active,
            Some(WhichTree::Pending) => &self.pending,
            None => panic!("top() on an empty eviction queue"),
        };
        heap.peek()
            .map(|entry| entry.queue.top())
            .unwrap_or_else(|| panic!("eviction heap emptied while choosing a tree"))
    }

    pub fn pop(&mut self) {
        let heap = match self.next_tree() {
            Some(WhichTree::Active) => &mut self.active,
            Some(WhichTree::Pending) => &mut self.pending,
            None => panic!("pop() on an empty eviction queue"),
        };
        if let Some(mut entry) = heap.peek_mut() {
            entry.queue.pop();
            if entry.queue.is_empty() {
                PeekMut::pop(entry);
            }
        }
    }
}

impl Iterator for EvictionTilePriorityQueue<'_> {
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
