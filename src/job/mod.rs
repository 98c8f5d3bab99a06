//! 作业模型 (Job model)
//!
//! 一个作业 = 一个视频 + 裁剪边距 + 时间窗口 + 派生输出路径.
//! 各阶段按固定顺序推进, 乱序调用返回 `State` 错误:
//!
//! ```text
//! Unloaded → Loaded → Preprocessed → FeaturesLocated → TrajectoriesLinked
//!          → [Filtered] → Exported → [Annotated] → Released
//! ```
//!
//! `import_trajectories` 从 `Loaded` 直接跳到 `Exported`; `release` 任意阶段可调用.

pub mod factory;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::annotate;
use crate::config::{AnnotateConfig, ExportFormat, FilterConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::tracking::{
    filter_clusters, filter_stubs, link_features, require_linked, store, Feature, FeatureLocator,
    TrajectoryLinker,
};
use crate::video::{self, Clip, CropRect, FrameShape, FrameSource, FrameWindow, GifWriter, Preprocessed};

pub use factory::configure_jobs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Unloaded,
    Loaded,
    Preprocessed,
    FeaturesLocated,
    TrajectoriesLinked,
    Filtered,
    Exported,
    Annotated,
    Released,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodUnit {
    Frame,
    Second,
    Minute,
}

impl fmt::Display for PeriodUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeriodUnit::Frame => "frame",
            PeriodUnit::Second => "second",
            PeriodUnit::Minute => "minute",
        })
    }
}

/// Selected time window `[start, end)` in some unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Period {
    pub start: f64,
    pub end: f64,
    pub unit: PeriodUnit,
}

impl Period {
    pub fn new(start: f64, end: f64, unit: PeriodUnit) -> Self {
        Self { start, end, unit }
    }

    pub fn frames(start: i64, end: i64) -> Self {
        Self::new(start as f64, end as f64, PeriodUnit::Frame)
    }

    /// Same window counted in frames. Idempotent once the unit is `Frame`.
    pub fn in_frames(&self, rate: f64) -> Self {
        let scale = match self.unit {
            PeriodUnit::Frame => return *self,
            PeriodUnit::Second => rate,
            PeriodUnit::Minute => 60.0 * rate,
        };
        Self::new(
            (self.start * scale).round(),
            (self.end * scale).round(),
            PeriodUnit::Frame,
        )
    }

    /// Frame window checked against the video length.
    fn window(&self, rate: f64, total: usize) -> Result<FrameWindow> {
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(Error::range(format!(
                "period [{}, {}) {}s has a non-finite bound",
                self.start, self.end, self.unit
            )));
        }
        let frames = self.in_frames(rate);
        if frames.start < 0.0 || frames.end > total as f64 || frames.start >= frames.end {
            return Err(Error::range(format!(
                "period [{}, {}) {}s maps to frames [{}, {}), outside [0, {}] or empty",
                self.start, self.end, self.unit, frames.start, frames.end, total
            )));
        }
        Ok(FrameWindow::new(frames.start as usize, frames.end as usize))
    }
}

/// Output files derived from the video base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub locate: PathBuf,
    pub tracks_table: PathBuf,
    pub tracks_csv: PathBuf,
    pub tracks_json: PathBuf,
    pub annotated: PathBuf,
}

impl JobPaths {
    fn derive(video: &Path, outdir: &Path) -> Self {
        let base = video
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let file = |suffix: &str| outdir.join(format!("{}-{}", base, suffix));
        Self {
            locate: file("locate.ptab"),
            tracks_table: file("tracks.ptab"),
            tracks_csv: file("tracks.csv"),
            tracks_json: file("tracks.json"),
            annotated: file("tracked.gif"),
        }
    }

    pub fn tracks(&self, format: ExportFormat) -> &Path {
        match format {
            ExportFormat::Table => &self.tracks_table,
            ExportFormat::Csv => &self.tracks_csv,
            ExportFormat::Json => &self.tracks_json,
        }
    }
}

pub struct Job {
    video: PathBuf,
    outdir: PathBuf,
    paths: JobPaths,
    margins: Option<Vec<i64>>,
    period: Option<Period>,
    annotated_particles: Vec<i64>,
    stage: Stage,

    source: Option<Arc<dyn FrameSource>>,
    clip: Option<Clip>,
    preprocessed: Option<Preprocessed>,
    trajectories: Vec<Feature>,
}

impl Job {
    /// `outdir` of `None` (or empty) means the video's own directory.
    pub fn new(
        video: impl Into<PathBuf>,
        outdir: Option<PathBuf>,
        margins: Option<Vec<i64>>,
        period: Option<Period>,
    ) -> Self {
        let video = video.into();
        let outdir = match outdir {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => match video.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            },
        };
        let paths = JobPaths::derive(&video, &outdir);
        Self {
            video,
            outdir,
            paths,
            margins,
            period,
            annotated_particles: Vec::new(),
            stage: Stage::Unloaded,
            source: None,
            clip: None,
            preprocessed: None,
            trajectories: Vec::new(),
        }
    }

    pub fn video(&self) -> &Path {
        &self.video
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn paths(&self) -> &JobPaths {
        &self.paths
    }

    pub fn margins(&self) -> Option<&[i64]> {
        self.margins.as_deref()
    }

    pub fn period(&self) -> Option<Period> {
        self.period
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn annotated_particles(&self) -> &[i64] {
        &self.annotated_particles
    }

    /// Restrict annotation to these particle ids. Empty means every particle.
    pub fn set_annotated_particles(&mut self, ids: Vec<i64>) {
        self.annotated_particles = ids;
    }

    pub fn trajectories(&self) -> &[Feature] {
        &self.trajectories
    }

    pub fn clip(&self) -> Option<&Clip> {
        self.clip.as_ref()
    }

    pub fn preprocessed(&self) -> Option<&Preprocessed> {
        self.preprocessed.as_ref()
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.source.as_ref().map(|s| s.frame_rate())
    }

    pub fn frame_shape(&self) -> Option<FrameShape> {
        self.source.as_ref().map(|s| s.frame_shape())
    }

    fn expect_stage(&self, allowed: &[Stage], operation: &str) -> Result<()> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(Error::state(format!(
                "{}: cannot {} in stage {} (needs {})",
                self.video.display(),
                operation,
                self.stage,
                allowed
                    .iter()
                    .map(Stage::to_string)
                    .collect::<Vec<_>>()
                    .join(" or ")
            )))
        }
    }

    /// Open the video file and resolve the frame window.
    pub fn load(&mut self) -> Result<()> {
        self.expect_stage(&[Stage::Unloaded], "load")?;
        let source = video::open(&self.video)?;
        self.attach(source)
    }

    /// Use an already opened frame source in place of the video file.
    pub fn attach(&mut self, source: Arc<dyn FrameSource>) -> Result<()> {
        self.expect_stage(&[Stage::Unloaded], "load")?;
        let rate = source.frame_rate();
        let window = match self.period {
            Some(period) => {
                let window = period.window(rate, source.len())?;
                self.period = Some(period.in_frames(rate));
                window
            }
            None => FrameWindow::new(0, source.len()),
        };
        self.clip = Some(Clip::new(source.clone(), window)?);
        tracing::info!(
            video = %self.video.display(),
            frames = source.len(),
            rate,
            start = window.start,
            end = window.end,
            "video loaded"
        );
        self.source = Some(source);
        self.stage = Stage::Loaded;
        Ok(())
    }

    /// Whether `margins` is a valid `[xmin, xmax, ymin, ymax]` crop of the
    /// loaded frames.
    pub fn valid_margins(&self, margins: &[i64]) -> Result<bool> {
        let shape = self
            .frame_shape()
            .ok_or_else(|| Error::state("frames must be loaded before checking margins"))?;
        let [xmin, xmax, ymin, ymax] = match <[i64; 4]>::try_from(margins) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };
        Ok(0 <= xmin
            && xmin < xmax
            && xmax <= shape.width as i64
            && 0 <= ymin
            && ymin < ymax
            && ymax <= shape.height as i64)
    }

    fn crop_rect(&self) -> Result<Option<CropRect>> {
        match &self.margins {
            None => Ok(None),
            Some(m) => {
                if !self.valid_margins(m)? {
                    return Err(Error::range(format!(
                        "crop margins {:?} do not fit frames of {:?}",
                        m,
                        self.frame_shape()
                    )));
                }
                CropRect::from_margins(m).map(Some)
            }
        }
    }

    /// Set up the lazy crop → grayscale → invert frame stream.
    pub fn preprocess(&mut self, invert: bool) -> Result<()> {
        self.expect_stage(&[Stage::Loaded], "preprocess")?;
        let crop = self.crop_rect()?;
        let clip = self
            .clip
            .clone()
            .ok_or_else(|| Error::state("no frames loaded"))?;
        self.preprocessed = Some(Preprocessed::new(clip, crop, invert)?);
        self.stage = Stage::Preprocessed;
        Ok(())
    }

    /// Detect features in every frame and store them in the feature file.
    pub fn locate(&mut self, locator: &dyn FeatureLocator) -> Result<usize> {
        self.expect_stage(&[Stage::Preprocessed], "locate features")?;
        let frames = self
            .preprocessed
            .as_ref()
            .ok_or_else(|| Error::state("frames not preprocessed"))?;

        let started = Instant::now();
        let mut features = Vec::new();
        for item in frames.iter() {
            let (number, frame) = item?;
            let found = locator.locate(&frame.to_array(), number)?;
            tracing::debug!(frame = number, features = found.len(), "located");
            features.extend(found);
        }
        store::write(&self.paths.locate, ExportFormat::Table, &features)?;
        tracing::info!(
            features = features.len(),
            frames = frames.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "features located"
        );
        self.stage = Stage::FeaturesLocated;
        Ok(features.len())
    }

    /// Link the stored features into trajectories. The linked table replaces
    /// the feature file.
    pub fn link(&mut self, linker: &mut dyn TrajectoryLinker) -> Result<usize> {
        self.expect_stage(&[Stage::FeaturesLocated], "link trajectories")?;
        let started = Instant::now();
        let features = store::read(&self.paths.locate, ExportFormat::Table)?;
        let linked = link_features(linker, features)?;
        store::write(&self.paths.locate, ExportFormat::Table, &linked)?;
        tracing::info!(
            rows = linked.len(),
            particles = count_particles(&linked),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "trajectories linked"
        );
        self.trajectories = linked;
        self.stage = Stage::TrajectoriesLinked;
        Ok(self.trajectories.len())
    }

    /// Apply the configured stub and cluster filters.
    pub fn filter(&mut self, config: &FilterConfig) -> Result<usize> {
        self.expect_stage(&[Stage::TrajectoriesLinked], "filter trajectories")?;
        let before = self.trajectories.len();
        let mut table = std::mem::take(&mut self.trajectories);
        if let Some(threshold) = config.stubs {
            table = filter_stubs(table, threshold)?;
        }
        table = filter_clusters(table, config.clusters_quantile, config.clusters_threshold)?;
        tracing::info!(before, after = table.len(), "trajectories filtered");
        self.trajectories = table;
        self.stage = Stage::Filtered;
        Ok(self.trajectories.len())
    }

    /// Shift coordinates back to the uncropped frame and write the
    /// trajectory table, overwriting any previous export.
    pub fn export_trajectories(&mut self, format: ExportFormat) -> Result<PathBuf> {
        self.expect_stage(
            &[Stage::TrajectoriesLinked, Stage::Filtered],
            "export trajectories",
        )?;
        let (dx, dy) = self
            .preprocessed
            .as_ref()
            .map(Preprocessed::offset)
            .unwrap_or((0.0, 0.0));
        for f in &mut self.trajectories {
            f.x += dx;
            f.y += dy;
        }
        let path = self.paths.tracks(format).to_path_buf();
        store::write(&path, format, &self.trajectories)?;
        tracing::info!(path = %path.display(), rows = self.trajectories.len(), "trajectories exported");
        self.stage = Stage::Exported;
        Ok(path)
    }

    /// Read a previous export back in, for annotating without tracking again.
    pub fn import_trajectories(&mut self, format: ExportFormat) -> Result<usize> {
        self.expect_stage(&[Stage::Loaded], "import trajectories")?;
        let path = self.paths.tracks(format);
        if !path.is_file() {
            return Err(Error::io(format!("trajectory file not found: {}", path.display())));
        }
        let table = store::read(path, format)?;
        require_linked(&table).map_err(|_| {
            Error::new(
                ErrorKind::Type,
                format!("{} has no particle column", path.display()),
            )
        })?;
        self.trajectories = table;
        self.stage = Stage::Exported;
        Ok(self.trajectories.len())
    }

    /// Render the trajectories onto the selected frames.
    pub fn annotate(&mut self, config: &AnnotateConfig) -> Result<PathBuf> {
        self.expect_stage(&[Stage::Exported], "annotate video")?;
        let clip = self
            .clip
            .clone()
            .ok_or_else(|| Error::state("no frames loaded"))?;
        let region = self.crop_rect()?;
        let started = Instant::now();

        let mut sink = GifWriter::create(&self.paths.annotated, clip.source().frame_rate())?;
        let request = annotate::Request {
            clip,
            trajectories: &self.trajectories,
            particles: &self.annotated_particles,
            region,
        };
        let written = match annotate::annotate(&request, config, &mut sink) {
            Ok(written) => written,
            Err(e) => {
                drop(sink);
                if let Err(rm) = std::fs::remove_file(&self.paths.annotated) {
                    tracing::warn!(path = %self.paths.annotated.display(), error = %rm, "cannot remove partial video");
                }
                return Err(e);
            }
        };
        tracing::info!(
            path = %self.paths.annotated.display(),
            frames = written,
            parallel = config.parallel,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "video annotated"
        );
        self.stage = Stage::Annotated;
        Ok(self.paths.annotated.clone())
    }

    /// Drop frames and trajectories and delete the feature file. Safe to
    /// call any number of times.
    pub fn release(&mut self) {
        self.preprocessed = None;
        self.clip = None;
        self.source = None;
        self.trajectories = Vec::new();
        if self.paths.locate.exists() {
            if let Err(e) = std::fs::remove_file(&self.paths.locate) {
                tracing::warn!(path = %self.paths.locate.display(), error = %e, "cannot remove feature file");
            }
        }
        self.stage = Stage::Released;
    }

    /// Multi-line human readable summary.
    pub fn describe(&self) -> String {
        let margins = match &self.margins {
            Some(m) => format!("{:?}", m),
            None => "none".to_string(),
        };
        let period = match self.period {
            Some(p) => format!("[{}, {}) {}s", p.start, p.end, p.unit),
            None => "full video".to_string(),
        };
        let mut text = format!(
            "video:   {}\noutdir:  {}\nmargins: {}\nperiod:  {}",
            self.video.display(),
            self.outdir.display(),
            margins,
            period
        );
        if !self.annotated_particles.is_empty() {
            text.push_str(&format!("\nannotate particles: {:?}", self.annotated_particles));
        }
        text
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("video", &self.video)
            .field("outdir", &self.outdir)
            .field("margins", &self.margins)
            .field("period", &self.period)
            .field("stage", &self.stage)
            .finish()
    }
}

fn count_particles(table: &[Feature]) -> usize {
    let mut ids: Vec<i64> = table.iter().filter_map(|f| f.particle).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.len()
}
