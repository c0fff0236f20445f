use raster_protocol::{Canvas, ResourceFormat, Rgba8};
use tiling_data::geometry::{ContentRect, ContentSize, IntRectExt, rect};

/// Writes one pixel in `format` byte order.
pub fn encode_pixel(format: ResourceFormat, color: Rgba8, out: &mut [u8]) {
    match format {
        ResourceFormat::Rgba8888 => out[..4].copy_from_slice(&[color.r, color.g, color.b, color.a]),
        ResourceFormat::Bgra8888 => out[..4].copy_from_slice(&[color.b, color.g, color.r, color.a]),
        ResourceFormat::Rgba4444 => {
            let packed = (u16::from(color.r >> 4) << 12)
                | (u16::from(color.g >> 4) << 8)
                | (u16::from(color.b >> 4) << 4)
                | u16::from(color.a >> 4);
            out[..2].copy_from_slice(&packed.to_le_bytes());
        }
    }
}

pub fn decode_pixel(format: ResourceFormat, bytes: &[u8]) -> Rgba8 {
    match format {
        ResourceFormat::Rgba8888 => Rgba8::new(bytes[0], bytes[1], bytes[2], bytes[3]),
        ResourceFormat::Bgra8888 => Rgba8::new(bytes[2], bytes[1], bytes[0], bytes[3]),
        ResourceFormat::Rgba4444 => {
            let packed = u16::from_le_bytes([bytes[0], bytes[1]]);
            let expand = |nibble: u16| ((nibble & 0xf) as u8) * 17;
            Rgba8::new(expand(packed >> 12), expand(packed >> 8), expand(packed >> 4), expand(packed))
        }
    }
}

fn blend_channel(src: u8, dst: u8, alpha: u8) -> u8 {
    let src = u32::from(src) * u32::from(alpha);
    let dst = u32::from(dst) * (255 - u32::from(alpha));
    ((src + dst + 127) / 255) as u8
}

fn source_over(src: Rgba8, dst: Rgba8) -> Rgba8 {
    if src.a == 255 {
        return src;
    }
    Rgba8::new(
        blend_channel(src.r, dst.r, src.a),
        blend_channel(src.g, dst.g, src.a),
        blend_channel(src.b, dst.b, src.a),
        src.a.saturating_add(blend_channel(0, dst.a, src.a)),
    )
}

/// A CPU canvas over borrowed pixel rows. Draws outside the canvas are
/// clipped.
#[derive(Debug)]
pub struct SoftwareCanvas<'a> {
    pixels: &'a mut [u8],
    size: ContentSize,
    stride: usize,
    format: ResourceFormat,
}

impl<'a> SoftwareCanvas<'a> {
    /// A canvas with tightly packed rows.
    pub fn new(pixels: &'a mut [u8], size: ContentSize, format: ResourceFormat) -> Self {
        let stride = size.width.max(0) as usize * format.bytes_per_pixel();
        Self::with_stride(pixels, size, stride, format)
    }

    pub fn with_stride(
        pixels: &'a mut [u8],
        size: ContentSize,
        stride: usize,
        format: ResourceFormat,
    ) -> Self {
        let row_bytes = size.width.max(0) as usize * format.bytes_per_pixel();
        assert!(stride >= row_bytes, "stride {stride} shorter than a {row_bytes} byte row");
        assert!(
            pixels.len() >= stride * size.height.max(0) as usize,
            "{} bytes cannot hold {size:?} at stride {stride}",
            pixels.len()
        );
        Self {
            pixels,
            size,
            stride,
            format,
        }
    }

    pub fn pixel(&self, x: i32, y: i32) -> Rgba8 {
        let offset = self.offset(x, y);
        decode_pixel(self.format, &self.pixels[offset..])
    }

    fn offset(&self, x: i32, y: i32) -> usize {
        assert!(
            x >= 0 && y >= 0 && x < self.size.width && y < self.size.height,
            "pixel ({x}, {y}) outside {:?}",
            self.size
        );
        y as usize * self.stride + x as usize * self.format.bytes_per_pixel()
    }

    fn clip(&self, target: ContentRect) -> ContentRect {
        target.intersect_rect(&rect(0, 0, self.size.width, self.size.height))
    }

    fn write_rect(&mut self, target: ContentRect, shade: impl Fn(Rgba8) -> Rgba8) {
        let target = self.clip(target);
        let bpp = self.format.bytes_per_pixel();
        for y in target.origin.y..target.bottom() {
            for x in target.origin.x..target.right() {
                let offset = self.offset(x, y);
                let pixel = &mut self.pixels[offset..offset + bpp];
                let shaded = shade(decode_pixel(self.format, pixel));
                encode_pixel(self.format, shaded, pixel);
            }
        }
    }
}

impl Canvas for SoftwareCanvas<'_> {
    fn clear_rect(&mut self, rect: ContentRect, color: Rgba8) {
        self.write_rect(rect, |_| color);
    }

    fn fill_rect(&mut self, rect: ContentRect, color: Rgba8) {
        self.write_rect(rect, |dst| source_over(color, dst));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureOp {
    Clear(ContentRect, Rgba8),
    Fill(ContentRect, Rgba8),
}

/// Records canvas calls so they can be replayed later, possibly on another
/// context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PictureCanvas {
    ops: Vec<PictureOp>,
}

impl PictureCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[PictureOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn replay(&self, canvas: &mut dyn Canvas) {
        for op in &self.ops {
            match *op {
                PictureOp::Clear(rect, color) => canvas.clear_rect(rect, color),
                PictureOp::Fill(rect, color) => canvas.fill_rect(rect, color),
            }
        }
    }
}

impl Canvas for PictureCanvas {
    fn clear_rect(&mut self, rect: ContentRect, color: Rgba8) {
        self.ops.push(PictureOp::Clear(rect, color));
    }

    fn fill_rect(&mut self, rect: ContentRect, color: Rgba8) {
        self.ops.push(PictureOp::Fill(rect, color));
    }
}
