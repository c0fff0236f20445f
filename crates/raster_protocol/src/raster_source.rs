use std::sync::Arc;

use euclid::Scale;
use serde::{Deserialize, Serialize};
use tiling_data::geometry::{
    ContentRect, ContentSpace, IntRectExt, LayerRect, LayerSize, LayerSpace, rect,
    scale_to_enclosing_rect,
};

use crate::{PlaybackSettings, Rgba8};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub u64);

/// One recorded paint operation in layer space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrawOp {
    FillRect { rect: LayerRect, color: Rgba8 },
    /// A decoded image is stood in for by its average color.
    Image {
        rect: LayerRect,
        image_id: ImageId,
        color: Rgba8,
    },
}

impl DrawOp {
    pub const fn rect(&self) -> LayerRect {
        match self {
            DrawOp::FillRect { rect, .. } | DrawOp::Image { rect, .. } => *rect,
        }
    }
}

/// Paint target for [`RasterSource::playback_to_canvas`]. Rects are in canvas
/// space: content space translated so the raster rect starts at the origin.
pub trait Canvas {
    fn clear_rect(&mut self, rect: ContentRect, color: Rgba8);
    fn fill_rect(&mut self, rect: ContentRect, color: Rgba8);
}

/// Supplies the pixels an image op paints with during playback.
pub trait ImageProvider: Send + Sync + std::fmt::Debug {
    /// Color to paint for `image_id`, given the color it was recorded with.
    fn substitute(&self, image_id: ImageId, recorded: Rgba8) -> Rgba8;
}

/// Plays every image back as recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordedImages;

impl ImageProvider for RecordedImages {
    fn substitute(&self, _image_id: ImageId, recorded: Rgba8) -> Rgba8 {
        recorded
    }
}

/// Immutable snapshot of what a layer paints. Shared between the compositor
/// thread and raster workers without locking.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSource {
    size: LayerSize,
    recorded_viewport: LayerRect,
    background_color: Rgba8,
    requires_clear: bool,
    ops: Vec<DrawOp>,
}

pub type SharedRasterSource = Arc<RasterSource>;

static_assertions::assert_impl_all!(RasterSource: Send, Sync);

impl RasterSource {
    pub const fn size(&self) -> LayerSize {
        self.size
    }

    pub const fn recorded_viewport(&self) -> LayerRect {
        self.recorded_viewport
    }

    pub const fn background_color(&self) -> Rgba8 {
        self.background_color
    }

    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    /// Whether everything inside `layer_rect` (clipped to the layer) was
    /// recorded and can be rasterized.
    pub fn covers_rect(&self, layer_rect: &LayerRect) -> bool {
        if self.size.is_empty() {
            return false;
        }
        let bounded = layer_rect.intersect_rect(&rect(0, 0, self.size.width, self.size.height));
        self.recorded_viewport.contains_area(&bounded)
    }

    /// Returns the color of `content_rect` when a single opaque color paints
    /// all of it.
    pub fn perform_solid_color_analysis(
        &self,
        content_rect: ContentRect,
        contents_scale: f32,
    ) -> Option<Rgba8> {
        let scale: Scale<f32, ContentSpace, LayerSpace> = Scale::new(1.0 / contents_scale);
        let layer_rect = scale_to_enclosing_rect(content_rect, scale);
        let mut color = (!self.requires_clear).then_some(self.background_color);
        for op in &self.ops {
            if !op.rect().intersects_rect(&layer_rect) {
                continue;
            }
            match op {
                DrawOp::FillRect { rect, color: fill }
                    if fill.is_opaque() && rect.contains_area(&layer_rect) =>
                {
                    color = Some(*fill);
                }
                _ => return None,
            }
        }
        color.filter(|color| color.is_opaque())
    }

    /// Image ids whose rect intersects `layer_rect`, in paint order.
    pub fn images_in_rect(&self, layer_rect: &LayerRect) -> Vec<ImageId> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::Image { rect, image_id, .. } if rect.intersects_rect(layer_rect) => {
                    Some(*image_id)
                }
                _ => None,
            })
            .collect()
    }

    /// Replays the recording into `canvas`.
    ///
    /// `canvas_bitmap_rect` is the content rect the canvas represents; only
    /// the part inside `canvas_playback_rect` is touched.
    pub fn playback_to_canvas(
        &self,
        canvas: &mut dyn Canvas,
        canvas_bitmap_rect: ContentRect,
        canvas_playback_rect: ContentRect,
        contents_scale: f32,
        settings: &PlaybackSettings,
    ) {
        self.playback_to_canvas_with_images(
            canvas,
            canvas_bitmap_rect,
            canvas_playback_rect,
            contents_scale,
            settings,
            &RecordedImages,
        );
    }

    /// [`Self::playback_to_canvas`] with image ops routed through `images`.
    pub fn playback_to_canvas_with_images(
        &self,
        canvas: &mut dyn Canvas,
        canvas_bitmap_rect: ContentRect,
        canvas_playback_rect: ContentRect,
        contents_scale: f32,
        settings: &PlaybackSettings,
        images: &dyn ImageProvider,
    ) {
        let clip = canvas_bitmap_rect
            .intersect_rect(&canvas_playback_rect)
            .translate(-canvas_bitmap_rect.origin.to_vector());
        if clip.is_empty() {
            return;
        }

        let clear_color = if self.requires_clear {
            Rgba8::TRANSPARENT
        } else {
            self.background_color
        };
        canvas.clear_rect(clip, clear_color);

        let scale: Scale<f32, LayerSpace, ContentSpace> = Scale::new(contents_scale);
        for op in &self.ops {
            let color = match op {
                DrawOp::FillRect { color, .. } => *color,
                DrawOp::Image { .. } if settings.skip_images => continue,
                DrawOp::Image { image_id, color, .. } => images.substitute(*image_id, *color),
            };
            let content = scale_to_enclosing_rect(op.rect(), scale)
                .translate(-canvas_bitmap_rect.origin.to_vector());
            let target = content.intersect_rect(&clip);
            if !target.is_empty() {
                canvas.fill_rect(target, color);
            }
        }
    }
}

/// Records paint operations into a [`RasterSource`].
#[derive(Debug, Clone)]
pub struct RasterSourceBuilder {
    source: RasterSource,
}

impl RasterSourceBuilder {
    pub fn new(size: LayerSize) -> Self {
        Self {
            source: RasterSource {
                size,
                recorded_viewport: rect(0, 0, size.width, size.height),
                background_color: Rgba8::WHITE,
                requires_clear: false,
                ops: Vec::new(),
            },
        }
    }

    pub fn recorded_viewport(mut self, viewport: LayerRect) -> Self {
        self.source.recorded_viewport = viewport;
        self
    }

    pub fn background_color(mut self, color: Rgba8) -> Self {
        self.source.background_color = color;
        self
    }

    pub fn requires_clear(mut self, requires_clear: bool) -> Self {
        self.source.requires_clear = requires_clear;
        self
    }

    pub fn fill_rect(mut self, rect: LayerRect, color: Rgba8) -> Self {
        self.source.ops.push(DrawOp::FillRect { rect, color });
        self
    }

    pub fn image(mut self, rect: LayerRect, image_id: ImageId, color: Rgba8) -> Self {
        self.source.ops.push(DrawOp::Image {
            rect,
            image_id,
            color,
        });
        self
    }

    pub fn build(self) -> SharedRasterSource {
        Arc::new(self.source)
    }
}
