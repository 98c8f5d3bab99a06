//! 粒子定位 (Feature location)
//!
//! 流程:
//! 1. 带通滤波: 高斯去噪 - 盒式背景, 负值与低于阈值处置零
//! 2. 灰度膨胀找局部极大值, 高于百分位阈值才保留
//! 3. 按亮度排序做间距抑制 (合并平台峰)
//! 4. 圆形掩膜内迭代质心细化 (亚像素)
//! 5. 按 min-mass / max-size / top-n 过滤

use image::{ImageBuffer, Luma};
use ndarray::Array2;

use super::{Feature, FeatureLocator};
use crate::config::LocateConfig;
use crate::error::Result;

/// Centroid shifts larger than this move the mask to a new pixel.
const SHIFT_THRESHOLD: f64 = 0.6;
const MAX_ITERATIONS: usize = 10;

pub struct CentroidLocator {
    config: LocateConfig,
    mask: Vec<(isize, isize)>,
}

impl CentroidLocator {
    pub fn new(config: LocateConfig) -> Self {
        let r = config.radius() as isize;
        let mask = (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| (dy, dx)))
            .filter(|(dy, dx)| dy * dy + dx * dx <= r * r)
            .collect();
        Self { config, mask }
    }
}

impl FeatureLocator for CentroidLocator {
    fn locate(&self, raw: &Array2<f32>, frame_number: usize) -> Result<Vec<Feature>> {
        let (h, w) = raw.dim();
        let radius = self.config.radius();
        if h <= 2 * radius || w <= 2 * radius {
            return Ok(Vec::new());
        }

        let processed = if self.config.preprocess {
            bandpass(
                raw,
                self.config.noise_size,
                self.config.smoothing_size,
                self.config.threshold,
            )
        } else {
            raw.clone()
        };

        let peaks = local_maxima(
            &processed,
            self.config.separation,
            self.config.percentile,
            radius,
        );

        let mut features: Vec<Feature> = peaks
            .into_iter()
            .filter_map(|(row, col)| self.refine(raw, &processed, row, col, frame_number))
            .filter(|f| f.mass >= self.config.min_mass)
            .filter(|f| self.config.max_size.map_or(true, |max| f.size <= max))
            .collect();

        if let Some(n) = self.config.top_n {
            features.sort_by(|a, b| b.mass.total_cmp(&a.mass));
            features.truncate(n);
        }
        features.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));
        Ok(features)
    }
}

impl CentroidLocator {
    fn refine(
        &self,
        raw: &Array2<f32>,
        processed: &Array2<f32>,
        row: usize,
        col: usize,
        frame_number: usize,
    ) -> Option<Feature> {
        let (h, w) = processed.dim();
        let r = self.config.radius();
        let (mut row, mut col) = (row, col);
        let (mut cy, mut cx, mut mass) = (0.0f64, 0.0f64, 0.0f64);

        let mut iteration = 0;
        loop {
            mass = 0.0;
            let (mut sy, mut sx) = (0.0f64, 0.0f64);
            for &(dy, dx) in &self.mask {
                let v = processed[[offset(row, dy), offset(col, dx)]] as f64;
                mass += v;
                sy += v * dy as f64;
                sx += v * dx as f64;
            }
            if mass <= 0.0 {
                return None;
            }
            cy = sy / mass;
            cx = sx / mass;

            iteration += 1;
            if iteration >= MAX_ITERATIONS
                || (cy.abs() <= SHIFT_THRESHOLD && cx.abs() <= SHIFT_THRESHOLD)
            {
                break;
            }
            let new_row = row as isize + cy.round() as isize;
            let new_col = col as isize + cx.round() as isize;
            // 掩膜必须完整落在图像内
            if new_row < r as isize
                || new_col < r as isize
                || new_row + r as isize >= h as isize
                || new_col + r as isize >= w as isize
            {
                break;
            }
            row = new_row as usize;
            col = new_col as usize;
        }

        let (mut rg, mut cos2, mut sin2, mut signal, mut raw_mass) = (0.0, 0.0, 0.0, 0.0f64, 0.0);
        let mut center = 0.0;
        for &(dy, dx) in &self.mask {
            let (y, x) = (offset(row, dy), offset(col, dx));
            let v = processed[[y, x]] as f64;
            rg += v * ((dy as f64 - cy).powi(2) + (dx as f64 - cx).powi(2));
            if dy == 0 && dx == 0 {
                center = v;
            } else {
                let theta = (dy as f64).atan2(dx as f64);
                cos2 += v * (2.0 * theta).cos();
                sin2 += v * (2.0 * theta).sin();
            }
            signal = signal.max(v);
            raw_mass += raw[[y, x]] as f64;
        }

        Some(Feature {
            y: row as f64 + cy,
            x: col as f64 + cx,
            mass,
            size: (rg / mass).sqrt(),
            ecc: (cos2.powi(2) + sin2.powi(2)).sqrt() / (mass - center + 1e-6),
            signal,
            raw_mass,
            frame: frame_number,
            particle: None,
        })
    }
}

#[inline]
fn offset(base: usize, delta: isize) -> usize {
    (base as isize + delta) as usize
}

/// Gaussian noise removal minus a boxcar background estimate. Negative
/// values and values under `threshold` become zero.
pub fn bandpass(image: &Array2<f32>, noise_size: f64, smoothing_size: f64, threshold: f64) -> Array2<f32> {
    let (h, w) = image.dim();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(w as u32, h as u32, |x, y| Luma([image[[y as usize, x as usize]]]));
    let blurred = imageproc::filter::gaussian_blur_f32(&buffer, noise_size as f32);

    let half = (smoothing_size.round() as usize) / 2;
    let background = boxcar(image, half);
    let threshold = threshold as f32;

    Array2::from_shape_fn((h, w), |(y, x)| {
        let v = blurred.get_pixel(x as u32, y as u32).0[0] - background[[y, x]];
        if v > 0.0 && v >= threshold {
            v
        } else {
            0.0
        }
    })
}

/// Mean over a `(2 * half + 1)` square window, clipped at the borders.
fn boxcar(image: &Array2<f32>, half: usize) -> Array2<f32> {
    let (h, w) = image.dim();
    // 积分图, 多一行一列
    let mut integral = Array2::<f64>::zeros((h + 1, w + 1));
    for y in 0..h {
        let mut row_sum = 0.0;
        for x in 0..w {
            row_sum += image[[y, x]] as f64;
            integral[[y + 1, x + 1]] = integral[[y, x + 1]] + row_sum;
        }
    }
    Array2::from_shape_fn((h, w), |(y, x)| {
        let (y0, y1) = (y.saturating_sub(half), (y + half + 1).min(h));
        let (x0, x1) = (x.saturating_sub(half), (x + half + 1).min(w));
        let sum = integral[[y1, x1]] - integral[[y0, x1]] - integral[[y1, x0]] + integral[[y0, x0]];
        (sum / ((y1 - y0) * (x1 - x0)) as f64) as f32
    })
}

/// Maximum over a `(2 * half + 1)` square window (grey dilation).
fn dilate(image: &Array2<f32>, half: usize) -> Array2<f32> {
    let (h, w) = image.dim();
    let rows = Array2::from_shape_fn((h, w), |(y, x)| {
        let (x0, x1) = (x.saturating_sub(half), (x + half + 1).min(w));
        (x0..x1).map(|i| image[[y, i]]).fold(f32::MIN, f32::max)
    });
    Array2::from_shape_fn((h, w), |(y, x)| {
        let (y0, y1) = (y.saturating_sub(half), (y + half + 1).min(h));
        (y0..y1).map(|j| rows[[j, x]]).fold(f32::MIN, f32::max)
    })
}

/// Linear-interpolated percentile of the strictly positive values.
fn positive_percentile(image: &Array2<f32>, percentile: f64) -> Option<f32> {
    let mut values: Vec<f32> = image.iter().copied().filter(|v| *v > 0.0).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);
    let rank = percentile / 100.0 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = (rank - lo as f64) as f32;
    Some(values[lo] + (values[hi] - values[lo]) * frac)
}

/// Local maxima above the percentile threshold, at least `margin` pixels
/// from every border, thinned so no two lie closer than `separation`.
fn local_maxima(
    image: &Array2<f32>,
    separation: f64,
    percentile: f64,
    margin: usize,
) -> Vec<(usize, usize)> {
    let Some(threshold) = positive_percentile(image, percentile) else {
        return Vec::new();
    };
    let (h, w) = image.dim();
    let half = (separation / 2.0).floor().max(1.0) as usize;
    let dilated = dilate(image, half);

    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for y in margin..h - margin {
        for x in margin..w - margin {
            let v = image[[y, x]];
            if v > threshold && v == dilated[[y, x]] {
                candidates.push((v, y, x));
            }
        }
    }

    // 亮度优先的间距抑制, 同亮度平台只留一个
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    let mut kept: Vec<(usize, usize)> = Vec::new();
    for (_, y, x) in candidates {
        let crowded = kept.iter().any(|&(ky, kx)| {
            let dy = ky as f64 - y as f64;
            let dx = kx as f64 - x as f64;
            (dy * dy + dx * dx).sqrt() < separation
        });
        if !crowded {
            kept.push((y, x));
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gaussian spots of the given centres on a flat background.
    fn spots(h: usize, w: usize, centres: &[(f64, f64)]) -> Array2<f32> {
        Array2::from_shape_fn((h, w), |(y, x)| {
            let mut v = 10.0f64;
            for &(cx, cy) in centres {
                let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                v += 180.0 * (-d2 / (2.0 * 2.0 * 2.0)).exp();
            }
            v as f32
        })
    }

    #[test]
    fn test_boxcar_and_dilate() {
        let mut img = Array2::<f32>::zeros((5, 5));
        img[[2, 2]] = 9.0;
        let mean = boxcar(&img, 1);
        assert!((mean[[2, 2]] - 1.0).abs() < 1e-6);
        // corner window is 2x2
        assert!((mean[[0, 0]] - 0.0).abs() < 1e-6);
        assert!((mean[[1, 1]] - 1.0).abs() < 1e-6);
        let max = dilate(&img, 1);
        assert_eq!(max[[1, 3]], 9.0);
        assert_eq!(max[[0, 0]], 0.0);
    }

    #[test]
    fn test_percentile() {
        let img = Array2::from_shape_vec((1, 5), vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(positive_percentile(&img, 0.0), Some(1.0));
        assert_eq!(positive_percentile(&img, 100.0), Some(4.0));
        assert_eq!(positive_percentile(&img, 50.0), Some(2.5));
        assert_eq!(positive_percentile(&Array2::zeros((2, 2)), 50.0), None);
    }

    #[test]
    fn test_locates_spots_with_subpixel_accuracy() {
        let centres = [(20.0, 20.0), (60.3, 22.0), (100.0, 40.6), (40.0, 70.0), (90.5, 75.5)];
        let img = spots(100, 130, &centres);
        let locator = CentroidLocator::new(LocateConfig::new(11));
        let features = locator.locate(&img, 4).unwrap();
        assert_eq!(features.len(), centres.len());
        for &(cx, cy) in &centres {
            let hit = features
                .iter()
                .find(|f| f.distance_to(cx, cy) < 0.5)
                .unwrap_or_else(|| panic!("no feature near ({}, {})", cx, cy));
            assert_eq!(hit.frame, 4);
            assert!(hit.mass > 0.0);
            assert!(hit.size > 0.0);
            assert!(hit.raw_mass > hit.mass);
        }
    }

    #[test]
    fn test_min_mass_and_top_n() {
        let img = spots(60, 120, &[(20.0, 30.0), (60.0, 30.0), (100.0, 30.0)]);
        let mut config = LocateConfig::new(11);
        config.top_n = Some(2);
        let features = CentroidLocator::new(config).locate(&img, 0).unwrap();
        assert_eq!(features.len(), 2);

        let mut config = LocateConfig::new(11);
        config.min_mass = 1e9;
        assert!(CentroidLocator::new(config).locate(&img, 0).unwrap().is_empty());
    }

    #[test]
    fn test_without_preprocessing() {
        let img = spots(60, 60, &[(30.0, 30.0)]);
        let mut config = LocateConfig::new(11);
        config.preprocess = false;
        let features = CentroidLocator::new(config).locate(&img, 0).unwrap();
        assert_eq!(features.len(), 1);
        // 平坦背景会把质心拉向掩膜中心, 峰在中心时无偏
        assert!(features[0].distance_to(30.0, 30.0) < 0.5);
    }

    #[test]
    fn test_flat_and_tiny_frames() {
        let locator = CentroidLocator::new(LocateConfig::new(11));
        assert!(locator.locate(&Array2::from_elem((50, 50), 7.0), 0).unwrap().is_empty());
        assert!(locator.locate(&Array2::zeros((8, 8)), 0).unwrap().is_empty());
    }
}
