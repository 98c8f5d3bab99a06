/// 视频输入输出 (Video I/O)
///
/// - FrameSource: 随机访问的帧序列 (解码后的视频)
/// - FrameSink:   按顺序写入的帧输出 (编码器)
/// - gif:         动画 GIF 后端 (基于 image crate 编解码)
/// - stack:       内存帧序列 (静态图片 / 合成数据)
/// - frames:      帧窗口、裁剪、灰度化、反色与惰性预处理流
pub mod frames;
pub mod gif;
pub mod stack;

use std::path::Path;
use std::sync::Arc;

use image::{ColorType, DynamicImage, RgbaImage};

use crate::error::{Error, Result};

pub use frames::{Clip, CropRect, FrameWindow, GrayFrame, Preprocessed};
pub use gif::{GifVideo, GifWriter};
pub use stack::FrameStack;

/// Height, width and colour channel count (alpha excluded) of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u8,
}

impl FrameShape {
    pub fn of(image: &DynamicImage) -> Self {
        let color = image.color();
        let channels = if color.has_alpha() {
            color.channel_count() - 1
        } else {
            color.channel_count()
        };
        Self {
            height: image.height(),
            width: image.width(),
            channels,
        }
    }
}

/// Bit depth of the source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDepth {
    U8,
    U16,
    U32,
    F32,
}

impl PixelDepth {
    pub fn of(color: ColorType) -> Self {
        match color {
            ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => PixelDepth::U8,
            ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => {
                PixelDepth::U16
            }
            _ => PixelDepth::F32,
        }
    }

    /// Largest representable intensity, used for colour inversion.
    pub fn max_value(&self) -> Result<f64> {
        match self {
            PixelDepth::U8 => Ok(255.0),
            PixelDepth::U16 => Ok(65535.0),
            PixelDepth::U32 => Ok(4_294_967_296.0),
            PixelDepth::F32 => Err(Error::unsupported(
                "cannot invert colors for floating point pixels",
            )),
        }
    }
}

/// Decoded video with random frame access.
pub trait FrameSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames per second.
    fn frame_rate(&self) -> f64;

    fn frame_shape(&self) -> FrameShape;

    fn pixel_depth(&self) -> PixelDepth;

    /// Frame `index` (0-based). Out of range is a `Range` error.
    fn frame(&self, index: usize) -> Result<DynamicImage>;
}

/// Ordered frame output.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()>;

    /// Flush and close the stream. Writing after `finish` is a `State` error.
    fn finish(&mut self) -> Result<()>;

    fn frames_written(&self) -> usize;
}

/// Open a video file. Animated GIFs are decoded frame by frame; any other
/// image format `image` can read is treated as a single-frame video.
pub fn open(path: impl AsRef<Path>) -> Result<Arc<dyn FrameSource>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::io(format!("file not found: {}", path.display())));
    }
    let is_gif = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gif"))
        .unwrap_or(false);
    if is_gif {
        return Ok(Arc::new(GifVideo::open(path)?));
    }
    let format = image::ImageFormat::from_path(path).map_err(|_| {
        Error::unsupported(format!("unrecognized video container: {}", path.display()))
    })?;
    let still = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| {
            Error::with_source(
                crate::error::ErrorKind::Io,
                format!("cannot decode {:?} file {}", format, path.display()),
                e,
            )
        })?;
    Ok(Arc::new(FrameStack::new(vec![still], 1.0)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_pixel_depth() {
        assert_eq!(PixelDepth::of(ColorType::Rgb8), PixelDepth::U8);
        assert_eq!(PixelDepth::of(ColorType::L16), PixelDepth::U16);
        assert_eq!(PixelDepth::of(ColorType::Rgba32F), PixelDepth::F32);
        assert_eq!(PixelDepth::U8.max_value().unwrap(), 255.0);
        assert_eq!(PixelDepth::U16.max_value().unwrap(), 65535.0);
        assert_eq!(PixelDepth::U32.max_value().unwrap(), 4_294_967_296.0);
        assert_eq!(
            PixelDepth::F32.max_value().unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[test]
    fn test_frame_shape_ignores_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(8, 4));
        assert_eq!(
            FrameShape::of(&img),
            FrameShape {
                height: 4,
                width: 8,
                channels: 3
            }
        );
    }

    #[test]
    fn test_open_missing_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let err = open(dir.path().join("missing.gif")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Io);

        let odd = dir.path().join("clip.xyz");
        std::fs::write(&odd, b"not a video").unwrap();
        let err = open(&odd).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_open_still_image_as_single_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::GrayImage::from_pixel(6, 5, image::Luma([40])).save(&path).unwrap();
        let video = open(&path).unwrap();
        assert_eq!(video.len(), 1);
        assert_eq!(video.frame_shape().channels, 1);
        assert_eq!(video.pixel_depth(), PixelDepth::U8);
    }
}
