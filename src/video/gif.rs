//! 动画 GIF 编解码
//! Animated GIF decode/encode through the `image` crate codecs.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::{AnimationDecoder, Delay, DynamicImage, Frame, RgbaImage};

use super::{FrameShape, FrameSink, FrameSource, PixelDepth};
use crate::error::{Error, ErrorKind, Result};

/// Playback rate assumed when a GIF declares a zero frame delay.
const FALLBACK_RATE: f64 = 10.0;

/// Fully decoded animated GIF. GIF frames are composited RGBA canvases, so
/// every frame has the same shape.
pub struct GifVideo {
    frames: Vec<RgbaImage>,
    rate: f64,
}

impl GifVideo {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let decoder = GifDecoder::new(reader)?;
        let frames = decoder.into_frames().collect_frames()?;
        if frames.is_empty() {
            return Err(Error::range(format!("video {} has no frames", path.display())));
        }

        let (numer, denom) = frames[0].delay().numer_denom_ms();
        let delay_ms = if denom == 0 {
            0.0
        } else {
            numer as f64 / denom as f64
        };
        let rate = if delay_ms > 0.0 {
            1000.0 / delay_ms
        } else {
            FALLBACK_RATE
        };

        tracing::debug!(
            path = %path.display(),
            frames = frames.len(),
            rate,
            "decoded gif"
        );
        Ok(Self {
            frames: frames.into_iter().map(Frame::into_buffer).collect(),
            rate,
        })
    }
}

impl FrameSource for GifVideo {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn frame_rate(&self) -> f64 {
        self.rate
    }

    fn frame_shape(&self) -> FrameShape {
        let first = &self.frames[0];
        FrameShape {
            height: first.height(),
            width: first.width(),
            channels: 3,
        }
    }

    fn pixel_depth(&self) -> PixelDepth {
        PixelDepth::U8
    }

    fn frame(&self, index: usize) -> Result<DynamicImage> {
        let rgba = self.frames.get(index).ok_or_else(|| {
            Error::range(format!(
                "frame {} out of range (video has {} frames)",
                index,
                self.frames.len()
            ))
        })?;
        // GIF 无真正透明通道语义, 丢弃 alpha
        Ok(DynamicImage::ImageRgb8(
            DynamicImage::ImageRgba8(rgba.clone()).to_rgb8(),
        ))
    }
}

/// First I/O error seen by a [`LatchedFile`].
type ErrorSlot = Arc<Mutex<Option<io::Error>>>;

/// File writer that keeps a copy of its first error. The encoder writes the
/// GIF trailer and flushes in `Drop`, where errors are discarded.
struct LatchedFile {
    file: File,
    error: ErrorSlot,
}

impl LatchedFile {
    fn latch(&self, err: io::Error) -> io::Error {
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                *slot = Some(io::Error::new(err.kind(), err.to_string()));
            }
        }
        err
    }
}

impl Write for LatchedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf).map_err(|e| self.latch(e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush().map_err(|e| self.latch(e))
    }
}

/// Animated GIF writer. Frames must all share the first frame's size.
pub struct GifWriter {
    path: PathBuf,
    encoder: Option<GifEncoder<BufWriter<LatchedFile>>>,
    error: ErrorSlot,
    delay: Delay,
    size: Option<(u32, u32)>,
    written: usize,
}

impl GifWriter {
    /// Create (or truncate) `path` for a video played at `rate` frames per
    /// second.
    pub fn create(path: impl AsRef<Path>, rate: f64) -> Result<Self> {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(Error::range(format!("invalid frame rate {}", rate)));
        }
        let path = path.as_ref();
        let error = ErrorSlot::default();
        let file = LatchedFile {
            file: File::create(path)?,
            error: Arc::clone(&error),
        };
        let mut encoder = GifEncoder::new_with_speed(BufWriter::new(file), 10);
        encoder.set_repeat(Repeat::Infinite)?;
        let fps = rate.round().max(1.0) as u32;
        Ok(Self {
            path: path.to_path_buf(),
            encoder: Some(encoder),
            error,
            delay: Delay::from_numer_denom_ms(1000, fps),
            size: None,
            written: 0,
        })
    }

    fn take_error(&self) -> Result<()> {
        let latched = match self.error.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => Some(io::Error::other("gif writer error slot poisoned")),
        };
        match latched {
            Some(e) => Err(Error::with_source(
                ErrorKind::Io,
                format!("cannot write {}: {}", self.path.display(), e),
                e,
            )),
            None => Ok(()),
        }
    }
}

impl FrameSink for GifWriter {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| Error::state(format!("{} already finished", self.path.display())))?;
        let dims = frame.dimensions();
        match self.size {
            None => self.size = Some(dims),
            Some(expected) if expected != dims => {
                return Err(Error::range(format!(
                    "frame size {:?} differs from stream size {:?}",
                    dims, expected
                )))
            }
            Some(_) => {}
        }
        encoder.encode_frame(Frame::from_parts(frame.clone(), 0, 0, self.delay))?;
        self.take_error()?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        // 释放编码器时写入 GIF 结尾并刷新缓冲
        match self.encoder.take() {
            Some(encoder) => {
                drop(encoder);
                self.take_error()
            }
            None => Err(Error::state(format!(
                "{} already finished",
                self.path.display()
            ))),
        }
    }

    fn frames_written(&self) -> usize {
        self.written
    }
}
