//! 视频标注 (Video annotation)
//!
//! 把轨迹画回原始帧并重新编码. 顺序模式逐帧绘制; 并行模式见 `pool`.

pub mod overlay;
pub mod pool;

use crate::config::AnnotateConfig;
use crate::error::Result;
use crate::tracking::Feature;
use crate::video::{Clip, CropRect, FrameSink};

pub use overlay::{id_to_color, LabelFont, LabelPlacement, Painter};

/// One particle position to draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marker {
    pub x: f64,
    pub y: f64,
    pub particle: i64,
}

/// Everything the annotator reads.
pub struct Request<'a> {
    pub clip: Clip,
    pub trajectories: &'a [Feature],
    /// Particle ids to draw; empty draws every particle.
    pub particles: &'a [i64],
    /// Crop region in source coordinates, if the job has one.
    pub region: Option<CropRect>,
}

impl Request<'_> {
    /// Markers grouped per clip frame, ordered by particle id.
    pub fn markers(&self) -> Vec<Vec<Marker>> {
        let window = self.clip.window();
        let mut frames = vec![Vec::new(); self.clip.len()];
        for f in self.trajectories {
            let Some(particle) = f.particle else { continue };
            if f.frame < window.start || f.frame >= window.end {
                continue;
            }
            if !self.particles.is_empty() && !self.particles.contains(&particle) {
                continue;
            }
            frames[f.frame - window.start].push(Marker {
                x: f.x,
                y: f.y,
                particle,
            });
        }
        for markers in &mut frames {
            markers.sort_by_key(|m| m.particle);
        }
        frames
    }
}

/// Draw every frame of the request into `sink` and finish it. Returns the
/// number of frames written.
pub fn annotate(request: &Request, config: &AnnotateConfig, sink: &mut dyn FrameSink) -> Result<usize> {
    let painter = Painter::new(config, request.region)?;
    let markers = request.markers();

    if config.parallel && config.workers > 1 && request.clip.len() > 1 {
        pool::render_parallel(&request.clip, &markers, &painter, config.workers, sink)?;
    } else {
        for (i, frame_markers) in markers.iter().enumerate() {
            let frame = request.clip.frame(i)?;
            let image = painter.render(&frame, request.clip.frame_number(i), frame_markers);
            sink.write_frame(&image)?;
        }
    }
    sink.finish()?;
    Ok(sink.frames_written())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::video::{FrameSource, FrameStack, FrameWindow};
    use image::{DynamicImage, RgbImage, RgbaImage};
    use std::sync::Arc;

    /// Sink keeping frames in memory.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub frames: Vec<RgbaImage>,
        pub finished: bool,
    }

    impl FrameSink for MemorySink {
        fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
            if self.finished {
                return Err(Error::state("finished"));
            }
            self.frames.push(frame.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }

        fn frames_written(&self) -> usize {
            self.frames.len()
        }
    }

    pub(crate) fn clip(n: usize, window: FrameWindow) -> Clip {
        let frames = (0..n)
            .map(|i| DynamicImage::ImageRgb8(RgbImage::from_pixel(48, 32, image::Rgb([i as u8 * 20, 0, 0]))))
            .collect();
        let source: Arc<dyn FrameSource> = Arc::new(FrameStack::new(frames, 10.0).unwrap());
        Clip::new(source, window).unwrap()
    }

    pub(crate) fn table(n: usize) -> Vec<Feature> {
        let mut out = Vec::new();
        for frame in 0..n {
            for particle in 0..3i64 {
                let mut f = Feature::at(frame, 8.0 + 12.0 * particle as f64 + frame as f64, 16.0);
                f.particle = Some(particle);
                out.push(f);
            }
        }
        out
    }

    #[test]
    fn test_markers_follow_window_and_allow_list() {
        let trajectories = table(6);
        let request = Request {
            clip: clip(6, FrameWindow::new(2, 5)),
            trajectories: &trajectories,
            particles: &[2, 0],
            region: None,
        };
        let markers = request.markers();
        assert_eq!(markers.len(), 3);
        assert!(markers.iter().all(|m| m.len() == 2));
        assert_eq!(markers[0][0].particle, 0);
        assert_eq!(markers[0][1].particle, 2);
        assert_eq!(markers[0][0].x, 10.0);
    }

    #[test]
    fn test_sequential_annotation() {
        let trajectories = table(4);
        let request = Request {
            clip: clip(4, FrameWindow::new(0, 4)),
            trajectories: &trajectories,
            particles: &[],
            region: Some(CropRect { x: 4, y: 4, width: 40, height: 24 }),
        };
        let mut config = AnnotateConfig::new(5);
        config.show_region = true;
        config.crop = true;
        let mut sink = MemorySink::default();
        assert_eq!(annotate(&request, &config, &mut sink).unwrap(), 4);
        assert!(sink.finished);
        assert!(sink.frames.iter().all(|f| f.dimensions() == (40, 24)));
    }
}
