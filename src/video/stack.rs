//! 内存帧序列
//! In-memory frame sequence: still images and synthetic clips.

use image::DynamicImage;

use super::{FrameShape, FrameSource, PixelDepth};
use crate::error::{Error, Result};

pub struct FrameStack {
    frames: Vec<DynamicImage>,
    rate: f64,
    shape: FrameShape,
    depth: PixelDepth,
}

impl FrameStack {
    /// Every frame must share the first frame's size and colour type.
    pub fn new(frames: Vec<DynamicImage>, rate: f64) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| Error::range("frame stack needs at least one frame"))?;
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(Error::range(format!("invalid frame rate {}", rate)));
        }
        let shape = FrameShape::of(first);
        let color = first.color();
        for (i, f) in frames.iter().enumerate().skip(1) {
            if FrameShape::of(f) != shape || f.color() != color {
                return Err(Error::unsupported(format!(
                    "frame {} differs in size or colour type from frame 0",
                    i
                )));
            }
        }
        Ok(Self {
            depth: PixelDepth::of(color),
            frames,
            rate,
            shape,
        })
    }
}

impl FrameSource for FrameStack {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn frame_rate(&self) -> f64 {
        self.rate
    }

    fn frame_shape(&self) -> FrameShape {
        self.shape
    }

    fn pixel_depth(&self) -> PixelDepth {
        self.depth
    }

    fn frame(&self, index: usize) -> Result<DynamicImage> {
        self.frames.get(index).cloned().ok_or_else(|| {
            Error::range(format!(
                "frame {} out of range (stack has {} frames)",
                index,
                self.frames.len()
            ))
        })
    }
}
