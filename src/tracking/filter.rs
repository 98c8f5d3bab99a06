//! 轨迹过滤 (Trajectory filters)

use std::collections::HashMap;

use super::{require_linked, Feature};
use crate::error::{Error, Result};

/// Keep only trajectories observed in at least `threshold` frames.
pub fn filter_stubs(features: Vec<Feature>, threshold: usize) -> Result<Vec<Feature>> {
    require_linked(&features)?;
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for f in &features {
        if let Some(p) = f.particle {
            *counts.entry(p).or_default() += 1;
        }
    }
    Ok(features
        .into_iter()
        .filter(|f| f.particle.map_or(false, |p| counts[&p] >= threshold))
        .collect())
}

/// Drop trajectories whose mean size exceeds a threshold.
///
/// `threshold` wins over `quantile`; the quantile is taken over every
/// feature size in the table. With neither given the table is returned
/// unchanged.
pub fn filter_clusters(
    features: Vec<Feature>,
    quantile: Option<f64>,
    threshold: Option<f64>,
) -> Result<Vec<Feature>> {
    require_linked(&features)?;
    let limit = match (threshold, quantile) {
        (Some(t), _) => t,
        (None, Some(q)) => {
            if !(0.0..=1.0).contains(&q) {
                return Err(Error::range(format!("quantile {} outside [0, 1]", q)));
            }
            match size_quantile(&features, q) {
                Some(v) => v,
                None => return Ok(features),
            }
        }
        (None, None) => return Ok(features),
    };

    let mut sums: HashMap<i64, (f64, usize)> = HashMap::new();
    for f in &features {
        if let Some(p) = f.particle {
            let entry = sums.entry(p).or_default();
            entry.0 += f.size;
            entry.1 += 1;
        }
    }
    Ok(features
        .into_iter()
        .filter(|f| {
            f.particle.map_or(false, |p| {
                let (sum, n) = sums[&p];
                sum / n as f64 <= limit
            })
        })
        .collect())
}

fn size_quantile(features: &[Feature], q: f64) -> Option<f64> {
    let mut sizes: Vec<f64> = features.iter().map(|f| f.size).collect();
    if sizes.is_empty() {
        return None;
    }
    sizes.sort_by(f64::total_cmp);
    let rank = q * (sizes.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sizes[lo] + (sizes[hi] - sizes[lo]) * (rank - lo as f64))
}
