use crate::geometry::{ContentRect, IntRectExt};
use crate::{TileIndex, TilingData};

/// Row-major walk over every tile touching `rect`.
///
/// With `include_borders` a tile is visited when its bordered bounds touch
/// the rect; otherwise only its inner bounds count.
#[derive(Debug, Clone)]
pub struct TileIterator {
    index_x: i32,
    index_y: i32,
    left: i32,
    right: i32,
    bottom: i32,
    done: bool,
}

impl TileIterator {
    pub fn new(tiling_data: &TilingData, consider_rect: ContentRect, include_borders: bool) -> Self {
        let mut iterator = Self {
            index_x: -1,
            index_y: -1,
            left: -1,
            right: -1,
            bottom: -1,
            done: true,
        };
        if tiling_data.has_empty_bounds() {
            return iterator;
        }

        let rect = consider_rect.intersect_rect(&tiling_data.tiling_rect());
        if rect.is_empty() {
            return iterator;
        }

        let top_left_tile = if include_borders {
            iterator.index_x = tiling_data.first_border_tile_x_index_from_src_coord(rect.origin.x);
            iterator.index_y = tiling_data.first_border_tile_y_index_from_src_coord(rect.origin.y);
            iterator.right = tiling_data.last_border_tile_x_index_from_src_coord(rect.right() - 1);
            iterator.bottom =
                tiling_data.last_border_tile_y_index_from_src_coord(rect.bottom() - 1);
            tiling_data.tile_bounds_with_border(iterator.index_x, iterator.index_y)
        } else {
            iterator.index_x = tiling_data.tile_x_index_from_src_coord(rect.origin.x);
            iterator.index_y = tiling_data.tile_y_index_from_src_coord(rect.origin.y);
            iterator.right = tiling_data.tile_x_index_from_src_coord(rect.right() - 1);
            iterator.bottom = tiling_data.tile_y_index_from_src_coord(rect.bottom() - 1);
            tiling_data.tile_bounds(iterator.index_x, iterator.index_y)
        };
        iterator.left = iterator.index_x;
        // Index conversions clamp, so a rect past the grid still yields an index.
        iterator.done = !top_left_tile.intersects_rect(&rect);
        iterator
    }
}

impl Iterator for TileIterator {
    type Item = TileIndex;

    fn next(&mut self) -> Option<TileIndex> {
        if self.done {
            return None;
        }
        let current = TileIndex::new(self.index_x, self.index_y);
        self.index_x += 1;
        if self.index_x > self.right {
            self.index_x = self.left;
            self.index_y += 1;
            if self.index_y > self.bottom {
                self.done = true;
            }
        }
        Some(current)
    }
}

/// Inclusive index bounds; an unset rect is all `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexRect {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

impl IndexRect {
    const UNSET: Self = Self {
        left: -1,
        top: -1,
        right: -1,
        bottom: -1,
    };

    fn contains(&self, i: i32, j: i32) -> bool {
        i >= self.left && i <= self.right && j >= self.top && j <= self.bottom
    }
}

/// Consider/ignore index bounds shared by the difference iterators.
#[derive(Debug, Clone, Copy)]
struct DifferenceBounds {
    consider: IndexRect,
    ignore: IndexRect,
}

impl DifferenceBounds {
    /// Returns `None` when nothing is left to visit.
    fn new(
        tiling_data: &TilingData,
        consider_rect: ContentRect,
        ignore_rect: ContentRect,
    ) -> Option<Self> {
        if tiling_data.has_empty_bounds() {
            return None;
        }
        let tiling_rect = tiling_data.tiling_rect();
        let consider = consider_rect.intersect_rect(&tiling_rect);
        if consider.is_empty() {
            return None;
        }
        let consider = IndexRect {
            left: tiling_data.tile_x_index_from_src_coord(consider.origin.x),
            top: tiling_data.tile_y_index_from_src_coord(consider.origin.y),
            right: tiling_data.tile_x_index_from_src_coord(consider.right() - 1),
            bottom: tiling_data.tile_y_index_from_src_coord(consider.bottom() - 1),
        };

        let ignore_rect = ignore_rect.intersect_rect(&tiling_rect);
        let mut ignore = IndexRect::UNSET;
        if !ignore_rect.is_empty() {
            ignore = IndexRect {
                left: tiling_data
                    .tile_x_index_from_src_coord(ignore_rect.origin.x)
                    .max(consider.left),
                top: tiling_data
                    .tile_y_index_from_src_coord(ignore_rect.origin.y)
                    .max(consider.top),
                right: tiling_data
                    .tile_x_index_from_src_coord(ignore_rect.right() - 1)
                    .min(consider.right),
                bottom: tiling_data
                    .tile_y_index_from_src_coord(ignore_rect.bottom() - 1)
                    .min(consider.bottom),
            };
        }

        if ignore == consider {
            return None;
        }
        Some(Self { consider, ignore })
    }
}

/// Row-major walk over tiles in `consider_rect` that are not in `ignore_rect`.
#[derive(Debug, Clone)]
pub struct DifferenceIterator {
    bounds: Option<DifferenceBounds>,
    index_x: i32,
    index_y: i32,
}

impl DifferenceIterator {
    pub fn new(tiling_data: &TilingData, consider_rect: ContentRect, ignore_rect: ContentRect) -> Self {
        let bounds = DifferenceBounds::new(tiling_data, consider_rect, ignore_rect);
        let mut iterator = Self {
            bounds,
            index_x: -1,
            index_y: -1,
        };
        if let Some(bounds) = bounds {
            iterator.index_x = bounds.consider.left;
            iterator.index_y = bounds.consider.top;
            if bounds.ignore.contains(iterator.index_x, iterator.index_y) {
                iterator.advance();
            }
        }
        iterator
    }

    fn advance(&mut self) {
        let Some(bounds) = self.bounds else {
            return;
        };
        loop {
            self.index_x += 1;
            if self.index_x > bounds.consider.right {
                self.index_x = bounds.consider.left;
                self.index_y += 1;
                if self.index_y > bounds.consider.bottom {
                    self.bounds = None;
                    return;
                }
            }
            if !bounds.ignore.contains(self.index_x, self.index_y) {
                return;
            }
            // Jump to the last ignored column; the next step leaves the ignore rect.
            self.index_x = bounds.ignore.right;
        }
    }
}

impl Iterator for DifferenceIterator {
    type Item = TileIndex;

    fn next(&mut self) -> Option<TileIndex> {
        self.bounds?;
        let current = TileIndex::new(self.index_x, self.index_y);
        self.advance();
        Some(current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Left,
    Down,
    Right,
}

impl Direction {
    const fn turn(self) -> Self {
        match self {
            Direction::Up => Direction::Left,
            Direction::Left => Direction::Down,
            Direction::Down => Direction::Right,
            Direction::Right => Direction::Up,
        }
    }

    const fn is_vertical(self) -> bool {
        matches!(self, Direction::Up | Direction::Down)
    }
}

/// Walks the tiles of `consider_rect` that are not in `ignore_rect` in rings
/// of growing size around `center_rect`.
///
/// The ring walk gives roughly increasing distance from the center; tiles on
/// the same ring are not sorted by exact distance.
#[derive(Debug, Clone)]
pub struct SpiralDifferenceIterator {
    bounds: Option<DifferenceBounds>,
    index_x: i32,
    index_y: i32,
    direction: Direction,
    delta_x: i32,
    delta_y: i32,
    current_step: i32,
    horizontal_step_count: i32,
    vertical_step_count: i32,
}

/// Index of the center edge clamped into `[-1, num_tiles]`.
fn around_index(
    src_coord: i32,
    center_is_empty: bool,
    extent: i32,
    num_tiles: i32,
    to_index: impl Fn(i32) -> i32,
) -> i32 {
    if src_coord < 0 || center_is_empty {
        -1
    } else if src_coord >= extent {
        num_tiles
    } else {
        to_index(src_coord)
    }
}

impl SpiralDifferenceIterator {
    pub fn new(
        tiling_data: &TilingData,
        consider_rect: ContentRect,
        ignore_rect: ContentRect,
        center_rect: ContentRect,
    ) -> Self {
        let mut iterator = Self {
            bounds: DifferenceBounds::new(tiling_data, consider_rect, ignore_rect),
            index_x: -1,
            index_y: -1,
            direction: Direction::Right,
            delta_x: 1,
            delta_y: 0,
            current_step: 0,
            horizontal_step_count: 0,
            vertical_step_count: 0,
        };
        if iterator.bounds.is_none() {
            return iterator;
        }

        let size = tiling_data.tiling_size();
        let center_is_empty = center_rect.is_empty();
        let around_left = around_index(
            center_rect.origin.x,
            center_is_empty,
            size.width,
            tiling_data.num_tiles_x(),
            |x| tiling_data.tile_x_index_from_src_coord(x),
        );
        let around_top = around_index(
            center_rect.origin.y,
            center_is_empty,
            size.height,
            tiling_data.num_tiles_y(),
            |y| tiling_data.tile_y_index_from_src_coord(y),
        );
        let around_right = around_index(
            center_rect.right() - 1,
            center_is_empty,
            size.width,
            tiling_data.num_tiles_x(),
            |x| tiling_data.tile_x_index_from_src_coord(x),
        );
        let around_bottom = around_index(
            center_rect.bottom() - 1,
            center_is_empty,
            size.height,
            tiling_data.num_tiles_y(),
            |y| tiling_data.tile_y_index_from_src_coord(y),
        );

        iterator.vertical_step_count = around_bottom - around_top + 1;
        iterator.horizontal_step_count = around_right - around_left + 1;
        iterator.current_step = iterator.horizontal_step_count - 1;
        iterator.index_x = around_right;
        iterator.index_y = around_bottom;

        // The start position is the bottom-right corner of the center, which
        // is never part of the walk.
        iterator.advance();
        iterator
    }

    fn current_step_count(&self) -> i32 {
        if self.direction.is_vertical() {
            self.vertical_step_count
        } else {
            self.horizontal_step_count
        }
    }

    fn switch_direction(&mut self) {
        let new_delta_x = self.delta_y;
        self.delta_y = -self.delta_x;
        self.delta_x = new_delta_x;

        self.current_step = 0;
        self.direction = self.direction.turn();
        if matches!(self.direction, Direction::Right | Direction::Left) {
            self.vertical_step_count += 1;
            self.horizontal_step_count += 1;
        }
    }

    fn take_steps(&mut self, steps: i32) {
        debug_assert!(steps >= 0);
        self.index_x += steps * self.delta_x;
        self.index_y += steps * self.delta_y;
        self.current_step += steps;
    }

    fn advance(&mut self) {
        let Some(bounds) = self.bounds else {
            return;
        };
        let consider = bounds.consider;
        let ignore = bounds.ignore;

        let mut cannot_hit_consider_count = 0;
        while cannot_hit_consider_count < 4 {
            if self.current_step >= self.current_step_count() {
                self.switch_direction();
            }

            self.take_steps(1);

            if consider.contains(self.index_x, self.index_y) {
                cannot_hit_consider_count = 0;
                if !ignore.contains(self.index_x, self.index_y) {
                    return;
                }

                // Skip to the last ignored tile on this side.
                let steps_to_edge = match self.direction {
                    Direction::Up => self.index_y - ignore.top,
                    Direction::Left => self.index_x - ignore.left,
                    Direction::Down => ignore.bottom - self.index_y,
                    Direction::Right => ignore.right - self.index_x,
                };
                let max_steps = self.current_step_count() - self.current_step;
                self.take_steps(steps_to_edge.min(max_steps));
            } else {
                let valid_column =
                    self.index_x >= consider.left && self.index_x <= consider.right;
                let valid_row = self.index_y >= consider.top && self.index_y <= consider.bottom;

                let mut steps_to_take = self.current_step_count() - self.current_step;
                let can_hit_consider_rect = match self.direction {
                    Direction::Up => {
                        if valid_column && consider.bottom < self.index_y {
                            steps_to_take = self.index_y - consider.bottom - 1;
                        }
                        consider.right >= self.index_x
                    }
                    Direction::Left => {
                        if valid_row && consider.right < self.index_x {
                            steps_to_take = self.index_x - consider.right - 1;
                        }
                        consider.top <= self.index_y
                    }
                    Direction::Down => {
                        if valid_column && consider.top > self.index_y {
                            steps_to_take = consider.top - self.index_y - 1;
                        }
                        consider.left <= self.index_x
                    }
                    Direction::Right => {
                        if valid_row && consider.left > self.index_x {
                            steps_to_take = consider.left - self.index_x - 1;
                        }
                        consider.bottom >= self.index_y
                    }
                };
                let max_steps = self.current_step_count() - self.current_step;
                self.take_steps(steps_to_take.min(max_steps));

                if can_hit_consider_rect {
                    cannot_hit_consider_count = 0;
                } else {
                    cannot_hit_consider_count += 1;
                }
            }
        }

        self.bounds = None;
    }
}

impl Iterator for SpiralDifferenceIterator {
    type Item = TileIndex;

    fn next(&mut self) -> Option<TileIndex> {
        self.bounds?;
        let current = TileIndex::new(self.index_x, self.index_y);
        self.advance();
        Some(current)
    }
}

/// The spiral walk from the outermost ring inward.
#[derive(Debug, Clone)]
pub struct ReverseSpiralDifferenceIterator {
    remaining: Vec<TileIndex>,
}

impl ReverseSpiralDifferenceIterator {
    pub fn new(
        tiling_data: &TilingData,
        consider_rect: ContentRect,
        ignore_rect: ContentRect,
        center_rect: ContentRect,
    ) -> Self {
        // Popping from the back yields the forward walk reversed.
        let remaining =
            SpiralDifferenceIterator::new(tiling_data, consider_rect, ignore_rect, center_rect)
                .collect();
        Self { remaining }
    }
}

impl Iterator for ReverseSpiralDifferenceIterator {
    type Item = TileIndex;

    fn next(&mut self) -> Option<TileIndex> {
        self.remaining.pop()
    }
}
