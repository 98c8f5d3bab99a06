//! 帧处理: 时间窗口、裁剪、灰度化、反色
//!
//! `Preprocessed` is a lazy stream: nothing is decoded or converted until a
//! frame is requested, and the stream can be walked any number of times.

use std::sync::Arc;

use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use ndarray::Array2;

use super::{FrameSource, PixelDepth};
use crate::error::{Error, Result};

pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Half-open frame index range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameWindow {
    pub start: usize,
    pub end: usize,
}

impl FrameWindow {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A frame window over a shared source.
#[derive(Clone)]
pub struct Clip {
    source: Arc<dyn FrameSource>,
    window: FrameWindow,
}

impl Clip {
    pub fn new(source: Arc<dyn FrameSource>, window: FrameWindow) -> Result<Self> {
        if window.start >= window.end || window.end > source.len() {
            return Err(Error::range(format!(
                "frame window [{}, {}) outside [0, {}]",
                window.start,
                window.end,
                source.len()
            )));
        }
        Ok(Self { source, window })
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn window(&self) -> FrameWindow {
        self.window
    }

    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    /// Absolute source frame number of the `index`-th clip frame.
    pub fn frame_number(&self, index: usize) -> usize {
        self.window.start + index
    }

    pub fn frame(&self, index: usize) -> Result<DynamicImage> {
        if index >= self.len() {
            return Err(Error::range(format!(
                "clip frame {} out of range (clip has {} frames)",
                index,
                self.len()
            )));
        }
        self.source.frame(self.frame_number(index))
    }
}

/// Crop rectangle in pixel coordinates of the original frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// From validated `[xmin, xmax, ymin, ymax]` margins.
    pub fn from_margins(margins: &[i64]) -> Result<Self> {
        let [xmin, xmax, ymin, ymax] = <[i64; 4]>::try_from(margins).map_err(|_| {
            Error::arity(format!("crop margins need 4 entries, got {}", margins.len()))
        })?;
        if xmin < 0 || ymin < 0 || xmin >= xmax || ymin >= ymax {
            return Err(Error::range(format!(
                "crop margins are not valid: {:?}",
                margins
            )));
        }
        let to_u32 = |v: i64| {
            u32::try_from(v).map_err(|_| Error::range(format!("crop margin {} too large", v)))
        };
        Ok(Self {
            x: to_u32(xmin)?,
            y: to_u32(ymin)?,
            width: to_u32(xmax - xmin)?,
            height: to_u32(ymax - ymin)?,
        })
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

pub fn crop(image: &DynamicImage, rect: CropRect) -> DynamicImage {
    image.crop_imm(rect.x, rect.y, rect.width, rect.height)
}

/// Single channel frame at the source bit depth.
#[derive(Debug, Clone, PartialEq)]
pub enum GrayFrame {
    U8(GrayImage),
    U16(Gray16Image),
}

impl GrayFrame {
    pub fn width(&self) -> u32 {
        match self {
            GrayFrame::U8(img) => img.width(),
            GrayFrame::U16(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            GrayFrame::U8(img) => img.height(),
            GrayFrame::U16(img) => img.height(),
        }
    }

    /// Row-major `(height, width)` intensity array.
    pub fn to_array(&self) -> Array2<f32> {
        let (w, h) = (self.width() as usize, self.height() as usize);
        let data: Vec<f32> = match self {
            GrayFrame::U8(img) => img.as_raw().iter().map(|&v| v as f32).collect(),
            GrayFrame::U16(img) => img.as_raw().iter().map(|&v| v as f32).collect(),
        };
        // 尺寸与像素数一致, 不会失败
        Array2::from_shape_vec((h, w), data).unwrap_or_else(|_| Array2::zeros((h, w)))
    }
}

#[inline]
fn luminance(r: f32, g: f32, b: f32) -> f32 {
    0.2125 * r + 0.7154 * g + 0.0721 * b
}

/// Convert to a single channel frame. Colour frames are weighted to
/// luminance and truncated back to the source bit depth; alpha is ignored.
pub fn as_gray(image: &DynamicImage) -> Result<GrayFrame> {
    match image {
        DynamicImage::ImageLuma8(img) => Ok(GrayFrame::U8(img.clone())),
        DynamicImage::ImageLumaA8(img) => Ok(GrayFrame::U8(GrayImage::from_fn(
            img.width(),
            img.height(),
            |x, y| Luma([img.get_pixel(x, y).0[0]]),
        ))),
        DynamicImage::ImageRgb8(img) => Ok(GrayFrame::U8(GrayImage::from_fn(
            img.width(),
            img.height(),
            |x, y| {
                let [r, g, b] = img.get_pixel(x, y).0;
                Luma([luminance(r as f32, g as f32, b as f32) as u8])
            },
        ))),
        DynamicImage::ImageRgba8(img) => Ok(GrayFrame::U8(GrayImage::from_fn(
            img.width(),
            img.height(),
            |x, y| {
                let [r, g, b, _] = img.get_pixel(x, y).0;
                Luma([luminance(r as f32, g as f32, b as f32) as u8])
            },
        ))),
        DynamicImage::ImageLuma16(img) => Ok(GrayFrame::U16(img.clone())),
        DynamicImage::ImageLumaA16(img) => Ok(GrayFrame::U16(Gray16Image::from_fn(
            img.width(),
            img.height(),
            |x, y| Luma([img.get_pixel(x, y).0[0]]),
        ))),
        DynamicImage::ImageRgb16(img) => Ok(GrayFrame::U16(Gray16Image::from_fn(
            img.width(),
            img.height(),
            |x, y| {
                let [r, g, b] = img.get_pixel(x, y).0;
                Luma([luminance(r as f32, g as f32, b as f32) as u16])
            },
        ))),
        DynamicImage::ImageRgba16(img) => Ok(GrayFrame::U16(Gray16Image::from_fn(
            img.width(),
            img.height(),
            |x, y| {
                let [r, g, b, _] = img.get_pixel(x, y).0;
                Luma([luminance(r as f32, g as f32, b as f32) as u16])
            },
        ))),
        other => Err(Error::unsupported(format!(
            "video color format not recognized: {:?}",
            other.color()
        ))),
    }
}

/// `max - value` for every pixel. `max` must be the depth's maximum.
pub fn invert_colors(frame: GrayFrame, max: f64) -> GrayFrame {
    match frame {
        GrayFrame::U8(mut img) => {
            let max = max.min(u8::MAX as f64) as u8;
            img.pixels_mut().for_each(|p| p.0[0] = max - p.0[0]);
            GrayFrame::U8(img)
        }
        GrayFrame::U16(mut img) => {
            let max = max.min(u16::MAX as f64) as u16;
            img.pixels_mut().for_each(|p| p.0[0] = max - p.0[0]);
            GrayFrame::U16(img)
        }
    }
}

/// Lazily preprocessed frames: crop → grayscale → optional invert.
#[derive(Clone)]
pub struct Preprocessed {
    clip: Clip,
    crop: Option<CropRect>,
    invert: Option<f64>,
}

impl Preprocessed {
    /// Fails with `Unsupported` for pixel types with no inversion or
    /// grayscale handling.
    pub fn new(clip: Clip, crop: Option<CropRect>, invert: bool) -> Result<Self> {
        let depth = clip.source().pixel_depth();
        if depth == PixelDepth::F32 {
            return Err(Error::unsupported(
                "floating point video frames are not supported",
            ));
        }
        let invert = if invert {
            Some(depth.max_value()?)
        } else {
            None
        };
        Ok(Self { clip, crop, invert })
    }

    pub fn len(&self) -> usize {
        self.clip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clip.is_empty()
    }

    pub fn clip(&self) -> &Clip {
        &self.clip
    }

    /// Offset to add to cropped coordinates to get original coordinates.
    pub fn offset(&self) -> (f64, f64) {
        self.crop
            .map(|r| (r.x as f64, r.y as f64))
            .unwrap_or((0.0, 0.0))
    }

    pub fn frame_number(&self, index: usize) -> usize {
        self.clip.frame_number(index)
    }

    pub fn frame(&self, index: usize) -> Result<GrayFrame> {
        let raw = self.clip.frame(index)?;
        let raw = match self.crop {
            Some(rect) => crop(&raw, rect),
            None => raw,
        };
        let gray = as_gray(&raw)?;
        Ok(match self.invert {
            Some(max) => invert_colors(gray, max),
            None => gray,
        })
    }

    /// `(frame number, frame)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(usize, GrayFrame)>> + '_ {
        (0..self.len()).map(move |i| self.frame(i).map(|f| (self.frame_number(i), f)))
    }
}
