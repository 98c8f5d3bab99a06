//! 粒子定位与轨迹链接 (Particle location and linking)
//!
//! - FeatureLocator:    单帧粒子检测接口
//! - TrajectoryLinker:  逐帧轨迹链接接口
//! - locate / link:     默认实现 (带通 + 局部极大值质心 / 最近邻链接)
//! - filter:            轨迹过滤 (短轨迹、团簇)
//! - store:             特征表读写 (table / csv / json)

pub mod filter;
pub mod link;
pub mod locate;
pub mod store;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use filter::{filter_clusters, filter_stubs};
pub use link::NearestNeighborLinker;
pub use locate::CentroidLocator;

/// One detected particle in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub y: f64,
    pub x: f64,
    /// Integrated intensity of the processed image.
    pub mass: f64,
    /// Radius of gyration.
    pub size: f64,
    pub ecc: f64,
    /// Peak intensity of the processed image.
    pub signal: f64,
    /// Integrated intensity of the raw image.
    pub raw_mass: f64,
    /// Absolute source frame number.
    pub frame: usize,
    /// Trajectory id, assigned by linking.
    pub particle: Option<i64>,
}

impl Feature {
    pub fn at(frame: usize, x: f64, y: f64) -> Self {
        Self {
            y,
            x,
            mass: 0.0,
            size: 0.0,
            ecc: 0.0,
            signal: 0.0,
            raw_mass: 0.0,
            frame,
            particle: None,
        }
    }

    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        ((self.x - x).powi(2) + (self.y - y).powi(2)).sqrt()
    }
}

/// Single-frame particle detector.
pub trait FeatureLocator {
    /// Detect features in a `(height, width)` intensity array.
    fn locate(&self, frame: &Array2<f32>, frame_number: usize) -> Result<Vec<Feature>>;
}

/// Frame-by-frame trajectory linker.
///
/// Frames are fed in increasing order; `update` writes a particle id into
/// every feature of the frame.
pub trait TrajectoryLinker {
    fn update(&mut self, frame: usize, features: &mut [Feature]) -> Result<()>;

    /// Forget every trajectory.
    fn reset(&mut self);

    /// Trajectories currently eligible for linking.
    fn track_count(&self) -> usize;
}

/// Link a whole feature table. Output is sorted by `(frame, particle)`.
pub fn link_features(
    linker: &mut dyn TrajectoryLinker,
    mut features: Vec<Feature>,
) -> Result<Vec<Feature>> {
    linker.reset();
    features.sort_by_key(|f| f.frame);

    let mut start = 0;
    while start < features.len() {
        let frame = features[start].frame;
        let end = features[start..]
            .iter()
            .position(|f| f.frame != frame)
            .map_or(features.len(), |n| start + n);
        linker.update(frame, &mut features[start..end])?;
        start = end;
    }

    if features.iter().any(|f| f.particle.is_none()) {
        return Err(Error::state("linker left features without a particle id"));
    }
    features.sort_by_key(|f| (f.frame, f.particle));
    Ok(features)
}

/// Error unless every feature carries a particle id.
pub fn require_linked(features: &[Feature]) -> Result<()> {
    if features.iter().all(|f| f.particle.is_some()) {
        Ok(())
    } else {
        Err(Error::state("trajectories are not linked"))
    }
}
