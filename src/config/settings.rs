//! 跟踪器与标注器配置
//! Tracker and annotator settings read from the top level of a job file.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use serde_yaml::Mapping;

use super::parser::{
    parse_bool, parse_file, parse_int, parse_int_or_float, parse_optional, parse_string,
};
use crate::error::{Error, Result};

/// Storage format of exported trajectories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Columnar binary table (`.ptab`).
    Table,
    /// Comma separated text.
    Csv,
    /// Column-oriented JSON.
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Table => "ptab",
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(ExportFormat::Table),
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(Error::range(format!(
                "attribute <export-format>: unknown format '{}' (expected table, csv or json)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Flip {
    None,
    Horizontal,
    Vertical,
    Both,
}

impl FromStr for Flip {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Flip::None),
            "horizontal" => Ok(Flip::Horizontal),
            "vertical" => Ok(Flip::Vertical),
            "both" => Ok(Flip::Both),
            other => Err(Error::range(format!(
                "attribute <annotate-flip>: unknown direction '{}'",
                other
            ))),
        }
    }
}

/// Feature detection parameters.
#[derive(Clone, Debug, Serialize)]
pub struct LocateConfig {
    pub diameter: u32,                 // 特征直径 (奇数)
    pub min_mass: f64,                 // 最小积分亮度
    pub max_size: Option<f64>,         // 最大回转半径
    pub separation: f64,               // 特征最小间距
    pub noise_size: f64,               // 高斯噪声尺度
    pub smoothing_size: f64,           // 背景平滑窗口
    pub threshold: f64,                // 带通后截断阈值
    pub percentile: f64,               // 峰值百分位阈值
    pub top_n: Option<usize>,          // 每帧最多保留特征数
    pub preprocess: bool,              // 是否带通预处理
}

impl LocateConfig {
    pub fn new(diameter: u32) -> Self {
        Self {
            diameter,
            min_mass: 0.0,
            max_size: None,
            separation: diameter as f64 + 1.0,
            noise_size: 1.0,
            smoothing_size: diameter as f64,
            threshold: 1.0,
            percentile: 64.0,
            top_n: None,
            preprocess: true,
        }
    }

    pub fn radius(&self) -> usize {
        (self.diameter / 2) as usize
    }
}

/// Linking parameters.
#[derive(Clone, Debug, Serialize)]
pub struct LinkConfig {
    pub search_range: f64,
    pub memory: usize,
    pub predict: bool,
    pub adaptive_stop: Option<f64>,
    pub adaptive_step: f64,
}

impl LinkConfig {
    pub fn new(search_range: f64) -> Self {
        Self {
            search_range,
            memory: 0,
            predict: false,
            adaptive_stop: None,
            adaptive_step: 0.95,
        }
    }
}

/// Trajectory filters applied after linking. Every field is optional.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FilterConfig {
    pub stubs: Option<usize>,
    pub clusters_quantile: Option<f64>,
    pub clusters_threshold: Option<f64>,
}

impl FilterConfig {
    pub fn is_active(&self) -> bool {
        self.stubs.is_some() || self.clusters_quantile.is_some() || self.clusters_threshold.is_some()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AnnotateConfig {
    pub enabled: bool,
    pub parallel: bool,
    pub show_region: bool,
    pub crop: bool,
    pub flip: Flip,
    pub frame_number: bool,
    pub radius: u32,
    pub font: Option<PathBuf>,
    pub font_size: f32,
    pub workers: usize,
}

impl AnnotateConfig {
    pub fn new(diameter: u32) -> Self {
        Self {
            enabled: false,
            parallel: false,
            show_region: false,
            crop: false,
            flip: Flip::None,
            frame_number: true,
            radius: diameter / 2 + 2,
            font: None,
            font_size: 14.0,
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Every top-level option of a job file.
#[derive(Clone, Debug, Serialize)]
pub struct TrackerConfig {
    pub locate: LocateConfig,
    pub link: LinkConfig,
    pub filter: FilterConfig,
    pub invert: bool,
    pub export_format: ExportFormat,
    pub annotate: AnnotateConfig,
}

fn positive(key: &str, value: f64) -> Result<f64> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(Error::range(format!(
            "attribute <{}> must be positive, got {}",
            key, value
        )))
    }
}

fn non_negative(key: &str, value: f64) -> Result<f64> {
    if value >= 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(Error::range(format!(
            "attribute <{}> must not be negative, got {}",
            key, value
        )))
    }
}

fn at_least(key: &str, value: i64, min: i64) -> Result<i64> {
    if value >= min {
        Ok(value)
    } else {
        Err(Error::range(format!(
            "attribute <{}> must be at least {}, got {}",
            key, min, value
        )))
    }
}

fn within(key: &str, value: f64, lo: f64, hi: f64) -> Result<f64> {
    if (lo..=hi).contains(&value) {
        Ok(value)
    } else {
        Err(Error::range(format!(
            "attribute <{}> must lie in [{}, {}], got {}",
            key, lo, hi, value
        )))
    }
}

impl TrackerConfig {
    /// Parse and validate the tracker options of `src`.
    ///
    /// `diameter` and `search-range` are required; every other attribute
    /// falls back to its default when absent.
    pub fn from_mapping(src: &Mapping) -> Result<Self> {
        // === 检测参数 ===
        let diameter = at_least("diameter", parse_int(src, "diameter")?, 3)?;
        if diameter % 2 == 0 {
            return Err(Error::range(format!(
                "attribute <diameter> must be odd, got {}",
                diameter
            )));
        }
        let diameter = u32::try_from(diameter)
            .map_err(|_| Error::range(format!("attribute <diameter> too large: {}", diameter)))?;
        let mut locate = LocateConfig::new(diameter);

        if let Some(v) = parse_optional(parse_int_or_float(src, "min-mass"))? {
            locate.min_mass = non_negative("min-mass", v)?;
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "max-size"))? {
            locate.max_size = Some(positive("max-size", v)?);
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "separation"))? {
            locate.separation = positive("separation", v)?;
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "noise-size"))? {
            locate.noise_size = positive("noise-size", v)?;
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "smoothing-size"))? {
            locate.smoothing_size = positive("smoothing-size", v)?;
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "threshold"))? {
            locate.threshold = non_negative("threshold", v)?;
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "percentile"))? {
            locate.percentile = within("percentile", v, 0.0, 100.0)?;
        }
        if let Some(v) = parse_optional(parse_int(src, "top-n"))? {
            locate.top_n = Some(at_least("top-n", v, 1)? as usize);
        }
        if let Some(v) = parse_optional(parse_bool(src, "preprocess"))? {
            locate.preprocess = v;
        }
        let invert = parse_optional(parse_bool(src, "invert"))?.unwrap_or(false);

        // === 链接参数 ===
        let search_range = positive("search-range", parse_int_or_float(src, "search-range")?)?;
        let mut link = LinkConfig::new(search_range);
        if let Some(v) = parse_optional(parse_int(src, "memory"))? {
            link.memory = at_least("memory", v, 0)? as usize;
        }
        if let Some(v) = parse_optional(parse_bool(src, "predict"))? {
            link.predict = v;
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "adaptive-stop"))? {
            let stop = positive("adaptive-stop", v)?;
            if stop >= search_range {
                return Err(Error::range(format!(
                    "attribute <adaptive-stop> ({}) must be smaller than <search-range> ({})",
                    stop, search_range
                )));
            }
            link.adaptive_stop = Some(stop);
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "adaptive-step"))? {
            if !(v > 0.0 && v < 1.0) {
                return Err(Error::range(format!(
                    "attribute <adaptive-step> must lie in (0, 1), got {}",
                    v
                )));
            }
            link.adaptive_step = v;
        }

        // === 轨迹过滤 ===
        let mut filter = FilterConfig::default();
        if let Some(v) = parse_optional(parse_int(src, "filter-stubs"))? {
            filter.stubs = Some(at_least("filter-stubs", v, 1)? as usize);
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "filter-clusters-quantile"))? {
            filter.clusters_quantile = Some(within("filter-clusters-quantile", v, 0.0, 1.0)?);
        }
        if let Some(v) = parse_optional(parse_int_or_float(src, "filter-clusters-threshold"))? {
            filter.clusters_threshold = Some(positive("filter-clusters-threshold", v)?);
        }

        let export_format = match parse_optional(parse_string(src, "export-format"))? {
            Some(s) => s.parse()?,
            None => ExportFormat::Csv,
        };

        // === 视频标注 ===
        let mut annotate = AnnotateConfig::new(diameter);
        if let Some(v) = parse_optional(parse_bool(src, "annotate"))? {
            annotate.enabled = v;
        }
        if let Some(v) = parse_optional(parse_bool(src, "annotate-parallel"))? {
            annotate.parallel = v;
        }
        if let Some(v) = parse_optional(parse_bool(src, "annotate-region"))? {
            annotate.show_region = v;
        }
        if let Some(v) = parse_optional(parse_bool(src, "annotate-crop"))? {
            annotate.crop = v;
        }
        if let Some(s) = parse_optional(parse_string(src, "annotate-flip"))? {
            annotate.flip = s.parse()?;
        }
        if let Some(v) = parse_optional(parse_bool(src, "annotate-frame-number"))? {
            annotate.frame_number = v;
        }
        if let Some(v) = parse_optional(parse_int(src, "annotate-radius"))? {
            let radius = i32::try_from(at_least("annotate-radius", v, 1)?).map_err(|_| {
                Error::range(format!("attribute <annotate-radius> is too large, got {}", v))
            })?;
            annotate.radius = radius as u32;
        }
        annotate.font = parse_optional(parse_file(src, "annotate-font"))?;
        if let Some(v) = parse_optional(parse_int_or_float(src, "annotate-font-size"))? {
            annotate.font_size = positive("annotate-font-size", v)? as f32;
        }
        if let Some(v) = parse_optional(parse_int(src, "annotate-workers"))? {
            annotate.workers = at_least("annotate-workers", v, 1)? as usize;
        }

        Ok(Self {
            locate,
            link,
            filter,
            invert,
            export_format,
            annotate,
        })
    }

    /// Pretty JSON dump, printed in verbose mode.
    pub fn summary(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<{}>", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::from_mapping(&mapping("diameter: 11\nsearch-range: 20\n"))
            .unwrap();
        assert_eq!(config.locate.diameter, 11);
        assert_eq!(config.locate.radius(), 5);
        assert_eq!(config.locate.separation, 12.0);
        assert_eq!(config.locate.smoothing_size, 11.0);
        assert_eq!(config.locate.percentile, 64.0);
        assert!(config.locate.preprocess);
        assert_eq!(config.link.search_range, 20.0);
        assert_eq!(config.link.memory, 0);
        assert!(!config.filter.is_active());
        assert_eq!(config.export_format, ExportFormat::Csv);
        assert!(!config.annotate.enabled);
        assert_eq!(config.annotate.flip, Flip::None);
        assert_eq!(config.annotate.radius, 7);
        assert!(config.annotate.workers >= 1);
    }

    #[test]
    fn test_full_configuration() {
        let config = TrackerConfig::from_mapping(&mapping(
            "diameter: 9\nmin-mass: 150\nmax-size: 3.5\ntop-n: 20\npreprocess: false\n\
             invert: true\nsearch-range: 15.5\nmemory: 3\npredict: true\n\
             adaptive-stop: 2\nadaptive-step: 0.9\nfilter-stubs: 5\n\
             filter-clusters-quantile: 0.8\nexport-format: json\nannotate: true\n\
             annotate-parallel: true\nannotate-flip: both\nannotate-workers: 2\n",
        ))
        .unwrap();
        assert_eq!(config.locate.min_mass, 150.0);
        assert_eq!(config.locate.max_size, Some(3.5));
        assert_eq!(config.locate.top_n, Some(20));
        assert!(!config.locate.preprocess);
        assert!(config.invert);
        assert_eq!(config.link.memory, 3);
        assert_eq!(config.link.adaptive_stop, Some(2.0));
        assert_eq!(config.filter.stubs, Some(5));
        assert_eq!(config.filter.clusters_quantile, Some(0.8));
        assert_eq!(config.export_format, ExportFormat::Json);
        assert!(config.annotate.enabled && config.annotate.parallel);
        assert_eq!(config.annotate.flip, Flip::Both);
        assert_eq!(config.annotate.workers, 2);
        assert!(config.summary().contains("\"search_range\": 15.5"));
    }

    #[test]
    fn test_required_attributes() {
        let err = TrackerConfig::from_mapping(&mapping("search-range: 20\n")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("diameter"));

        let err = TrackerConfig::from_mapping(&mapping("diameter: 11\n")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("search-range"));
    }

    #[test]
    fn test_constraints() {
        let cases = [
            ("diameter: 10\nsearch-range: 20\n", ErrorKind::Range),
            ("diameter: 11.0\nsearch-range: 20\n", ErrorKind::Type),
            ("diameter: 11\nsearch-range: -1\n", ErrorKind::Range),
            ("diameter: 11\nsearch-range: 20\npercentile: 120\n", ErrorKind::Range),
            ("diameter: 11\nsearch-range: 20\nadaptive-stop: 25\n", ErrorKind::Range),
            ("diameter: 11\nsearch-range: 20\nexport-format: hdf5\n", ErrorKind::Range),
            ("diameter: 11\nsearch-range: 20\nannotate-flip: sideways\n", ErrorKind::Range),
            ("diameter: 11\nsearch-range: 20\nmemory: [1, 2]\n", ErrorKind::Arity),
            ("diameter: 11\nsearch-range: 20\nannotate-radius: 0\n", ErrorKind::Range),
            ("diameter: 11\nsearch-range: 20\nannotate-radius: 4294967297\n", ErrorKind::Range),
        ];
        for (yaml, kind) in cases {
            let err = TrackerConfig::from_mapping(&mapping(yaml)).unwrap_err();
            assert_eq!(err.kind(), kind, "{}", yaml);
        }
    }
}
